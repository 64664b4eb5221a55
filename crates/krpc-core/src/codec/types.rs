//! Declared types.
//!
//! The codec never infers a type from the bytes: every encode and decode is
//! driven by a [`TypeDesc`] taken from the procedure signature at the call
//! site.

use std::fmt;

/// Protocol messages that can travel as values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Request,
    Response,
    Services,
    Status,
    StreamMessage,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "Request",
            MessageKind::Response => "Response",
            MessageKind::Services => "Services",
            MessageKind::Status => "Status",
            MessageKind::StreamMessage => "StreamMessage",
        }
    }
}

/// Declared type of a parameter or return value, one case per wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    Double,
    Float,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Bool,
    String,
    Bytes,
    /// Enumeration, carried as its int32 ordinal. Holds the qualified name.
    Enum(String),
    /// Opaque object handle. Holds the qualified class name.
    Class(String),
    Tuple(Vec<TypeDesc>),
    List(Box<TypeDesc>),
    Set(Box<TypeDesc>),
    Dictionary(Box<TypeDesc>, Box<TypeDesc>),
    Message(MessageKind),
}

impl TypeDesc {
    pub fn enumeration(name: impl Into<String>) -> Self {
        TypeDesc::Enum(name.into())
    }

    pub fn class(name: impl Into<String>) -> Self {
        TypeDesc::Class(name.into())
    }

    pub fn list(element: TypeDesc) -> Self {
        TypeDesc::List(Box::new(element))
    }

    pub fn set(element: TypeDesc) -> Self {
        TypeDesc::Set(Box::new(element))
    }

    pub fn dictionary(key: TypeDesc, value: TypeDesc) -> Self {
        TypeDesc::Dictionary(Box::new(key), Box::new(value))
    }

    /// Scalars with a fixed wire form (not enums, classes or containers).
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            TypeDesc::Double
                | TypeDesc::Float
                | TypeDesc::Int32
                | TypeDesc::Int64
                | TypeDesc::UInt32
                | TypeDesc::UInt64
                | TypeDesc::Bool
                | TypeDesc::String
                | TypeDesc::Bytes
        )
    }

    /// Dictionary keys are restricted to primitives and enums.
    pub fn is_valid_key(&self) -> bool {
        self.is_primitive() || matches!(self, TypeDesc::Enum(_))
    }

    /// Check the type is well formed, recursively.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            TypeDesc::Tuple(items) => {
                if items.is_empty() {
                    return Err("Tuple must have at least one element".to_string());
                }
                items.iter().try_for_each(TypeDesc::validate)
            }
            TypeDesc::List(element) | TypeDesc::Set(element) => element.validate(),
            TypeDesc::Dictionary(key, value) => {
                if !key.is_valid_key() {
                    return Err(format!("{} cannot be used as a dictionary key", key));
                }
                key.validate()?;
                value.validate()
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDesc::Double => write!(f, "double"),
            TypeDesc::Float => write!(f, "float"),
            TypeDesc::Int32 => write!(f, "int32"),
            TypeDesc::Int64 => write!(f, "int64"),
            TypeDesc::UInt32 => write!(f, "uint32"),
            TypeDesc::UInt64 => write!(f, "uint64"),
            TypeDesc::Bool => write!(f, "bool"),
            TypeDesc::String => write!(f, "string"),
            TypeDesc::Bytes => write!(f, "bytes"),
            TypeDesc::Enum(name) => write!(f, "Enum({})", name),
            TypeDesc::Class(name) => write!(f, "Class({})", name),
            TypeDesc::Tuple(items) => {
                write!(f, "Tuple(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            TypeDesc::List(element) => write!(f, "List({})", element),
            TypeDesc::Set(element) => write!(f, "Set({})", element),
            TypeDesc::Dictionary(key, value) => write!(f, "Dictionary({},{})", key, value),
            TypeDesc::Message(kind) => write!(f, "KRPC.{}", kind.as_str()),
        }
    }
}
