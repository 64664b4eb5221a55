//! Dynamic values exchanged with procedure handlers.

use super::types::TypeDesc;
use crate::messages::Message;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Shared reference to a live host object.
///
/// Identity is the address of the shared allocation, so two clones of the
/// same `ObjectRef` are the same object while two separately allocated
/// objects never are, even if they compare equal by value.
#[derive(Clone)]
pub struct ObjectRef(Arc<dyn Any + Send + Sync>);

impl ObjectRef {
    pub fn new<T: Any + Send + Sync>(object: T) -> Self {
        Self(Arc::new(object))
    }

    pub fn from_arc<T: Any + Send + Sync>(object: Arc<T>) -> Self {
        Self(object)
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.0).downcast::<T>().ok()
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.identity() == other.identity()
    }

    /// Address of the shared allocation.
    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.identity())
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

/// A decoded value. Which variant is legal is decided by the declared type.
#[derive(Debug, Clone)]
pub enum Value {
    Double(f64),
    Float(f32),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    Enum(i32),
    /// Class instance; `None` is the null reference.
    Object(Option<ObjectRef>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    /// Unordered, duplicate-free.
    Set(Vec<Value>),
    /// Unordered, keys unique.
    Dictionary(Vec<(Value, Value)>),
    Message(Box<Message>),
}

impl Value {
    pub fn object(object: ObjectRef) -> Self {
        Value::Object(Some(object))
    }

    pub fn null_object() -> Self {
        Value::Object(None)
    }

    /// Build a set, dropping duplicates while keeping first occurrences.
    pub fn set_from(items: impl IntoIterator<Item = Value>) -> Self {
        let mut unique: Vec<Value> = Vec::new();
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Value::Set(unique)
    }

    /// Build a dictionary; a repeated key replaces the earlier entry.
    pub fn dictionary_from(entries: impl IntoIterator<Item = (Value, Value)>) -> Self {
        let mut unique: Vec<(Value, Value)> = Vec::new();
        for (key, value) in entries {
            match unique.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => unique.push((key, value)),
            }
        }
        Value::Dictionary(unique)
    }

    /// Short name of the runtime shape, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Double(_) => "double",
            Value::Float(_) => "float",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::UInt32(_) => "uint32",
            Value::UInt64(_) => "uint64",
            Value::Bool(_) => "bool",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Enum(_) => "enum",
            Value::Object(_) => "class",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Dictionary(_) => "dictionary",
            Value::Message(_) => "message",
        }
    }

    /// Whether the runtime shape matches `ty`, recursively.
    pub fn conforms_to(&self, ty: &TypeDesc) -> bool {
        match (self, ty) {
            (Value::Double(_), TypeDesc::Double)
            | (Value::Float(_), TypeDesc::Float)
            | (Value::Int32(_), TypeDesc::Int32)
            | (Value::Int64(_), TypeDesc::Int64)
            | (Value::UInt32(_), TypeDesc::UInt32)
            | (Value::UInt64(_), TypeDesc::UInt64)
            | (Value::Bool(_), TypeDesc::Bool)
            | (Value::String(_), TypeDesc::String)
            | (Value::Bytes(_), TypeDesc::Bytes)
            | (Value::Enum(_), TypeDesc::Enum(_))
            | (Value::Object(_), TypeDesc::Class(_)) => true,
            (Value::Tuple(items), TypeDesc::Tuple(types)) => {
                items.len() == types.len()
                    && items.iter().zip(types).all(|(item, ty)| item.conforms_to(ty))
            }
            (Value::List(items), TypeDesc::List(element))
            | (Value::Set(items), TypeDesc::Set(element)) => {
                items.iter().all(|item| item.conforms_to(element))
            }
            (Value::Dictionary(entries), TypeDesc::Dictionary(key, value)) => entries
                .iter()
                .all(|(k, v)| k.conforms_to(key) && v.conforms_to(value)),
            (Value::Message(message), TypeDesc::Message(kind)) => message.kind() == *kind,
            _ => false,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Float(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) | Value::Enum(v) => Some(i64::from(*v)),
            Value::Int64(v) => Some(*v),
            Value::UInt32(v) => Some(i64::from(*v)),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    /// The referenced object, or `None` for non-class values and null references.
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(object) => object.as_ref(),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Value::Message(message) => Some(message),
            _ => None,
        }
    }
}

fn same_members(left: &[Value], right: &[Value]) -> bool {
    left.len() == right.len() && left.iter().all(|item| right.contains(item))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::Int64(a), Value::Int64(b)) => a == b,
            (Value::UInt32(a), Value::UInt32(b)) => a == b,
            (Value::UInt64(a), Value::UInt64(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Enum(a), Value::Enum(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) | (Value::List(a), Value::List(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => same_members(a, b),
            (Value::Dictionary(a), Value::Dictionary(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(key, value)| {
                        b.iter().any(|(other_key, other_value)| {
                            key == other_key && value == other_value
                        })
                    })
            }
            (Value::Message(a), Value::Message(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! impl_from_scalar {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }
        )*
    };
}

impl_from_scalar! {
    f64 => Double,
    f32 => Float,
    i32 => Int32,
    i64 => Int64,
    u32 => UInt32,
    u64 => UInt64,
    bool => Bool,
    String => String,
    Vec<u8> => Bytes,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        Value::Message(Box::new(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_identity() {
        let a = ObjectRef::new(5u32);
        let b = ObjectRef::new(5u32);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(a.downcast_ref::<u32>(), Some(&5));
        assert!(a.downcast::<String>().is_none());
    }

    #[test]
    fn test_set_equality_ignores_order() {
        let a = Value::set_from(vec![Value::Int32(1), Value::Int32(2), Value::Int32(1)]);
        let b = Value::Set(vec![Value::Int32(2), Value::Int32(1)]);
        assert_eq!(a, b);
        assert_ne!(a, Value::List(vec![Value::Int32(1), Value::Int32(2)]));
    }

    #[test]
    fn test_dictionary_last_key_wins() {
        let dict = Value::dictionary_from(vec![
            (Value::from("a"), Value::Int32(1)),
            (Value::from("a"), Value::Int32(2)),
        ]);
        assert_eq!(
            dict,
            Value::Dictionary(vec![(Value::from("a"), Value::Int32(2))])
        );
    }

    #[test]
    fn test_conforms_to() {
        let ty = TypeDesc::Tuple(vec![TypeDesc::Double, TypeDesc::list(TypeDesc::String)]);
        let good = Value::Tuple(vec![Value::Double(1.0), Value::List(vec!["x".into()])]);
        let bad = Value::Tuple(vec![Value::Double(1.0), Value::List(vec![Value::Int32(1)])]);
        assert!(good.conforms_to(&ty));
        assert!(!bad.conforms_to(&ty));
        assert!(Value::null_object().conforms_to(&TypeDesc::class("C")));
        assert!(!Value::Int32(1).conforms_to(&TypeDesc::Int64));
    }
}
