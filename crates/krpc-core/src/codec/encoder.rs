//! Value encoder.

use super::types::TypeDesc;
use super::value::Value;
use super::wire::{put_bytes_field, put_length_delimited, put_varint, zigzag_encode32, zigzag_encode64};
use crate::registry::ObjectRegistry;
use crate::CodecError;
use bytes::BufMut;

/// Encode `value` against its declared type.
///
/// Encoding a live object allocates its handle in `objects` on first use.
pub fn encode(
    value: &Value,
    ty: &TypeDesc,
    objects: &mut ObjectRegistry,
) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    encode_into(&mut buf, value, ty, objects)?;
    Ok(buf)
}

/// Encode an optional value; an absent value is zero bytes.
pub fn encode_optional(
    value: Option<&Value>,
    ty: &TypeDesc,
    objects: &mut ObjectRegistry,
) -> Result<Vec<u8>, CodecError> {
    match value {
        Some(value) => encode(value, ty, objects),
        None => Ok(Vec::new()),
    }
}

fn mismatch(value: &Value, ty: &TypeDesc) -> CodecError {
    CodecError::TypeMismatch {
        expected: ty.to_string(),
        found: value.kind_name().to_string(),
    }
}

fn encode_into(
    buf: &mut Vec<u8>,
    value: &Value,
    ty: &TypeDesc,
    objects: &mut ObjectRegistry,
) -> Result<(), CodecError> {
    match (ty, value) {
        (TypeDesc::Enum(_), Value::Enum(ordinal)) => {
            put_varint(buf, u64::from(zigzag_encode32(*ordinal)));
        }
        (TypeDesc::Double, Value::Double(v)) => buf.put_f64_le(*v),
        (TypeDesc::Float, Value::Float(v)) => buf.put_f32_le(*v),
        (TypeDesc::Int32, Value::Int32(v)) => put_varint(buf, u64::from(zigzag_encode32(*v))),
        (TypeDesc::Int64, Value::Int64(v)) => put_varint(buf, zigzag_encode64(*v)),
        (TypeDesc::UInt32, Value::UInt32(v)) => put_varint(buf, u64::from(*v)),
        (TypeDesc::UInt64, Value::UInt64(v)) => put_varint(buf, *v),
        (TypeDesc::Bool, Value::Bool(v)) => put_varint(buf, u64::from(*v)),
        (TypeDesc::String, Value::String(v)) => put_length_delimited(buf, v.as_bytes()),
        (TypeDesc::Bytes, Value::Bytes(v)) => put_length_delimited(buf, v),
        (TypeDesc::Class(_), Value::Object(object)) => {
            let handle = match object {
                Some(object) => objects.handle_for(object),
                None => 0,
            };
            put_varint(buf, handle);
        }
        (TypeDesc::Tuple(types), Value::Tuple(items)) => {
            if items.len() != types.len() {
                return Err(CodecError::TypeMismatch {
                    expected: ty.to_string(),
                    found: format!("tuple of {} elements", items.len()),
                });
            }
            for (item, item_type) in items.iter().zip(types) {
                put_bytes_field(buf, 1, &encode(item, item_type, objects)?);
            }
        }
        (TypeDesc::List(element), Value::List(items))
        | (TypeDesc::Set(element), Value::Set(items)) => {
            for item in items {
                put_bytes_field(buf, 1, &encode(item, element, objects)?);
            }
        }
        (TypeDesc::Dictionary(key_type, value_type), Value::Dictionary(entries)) => {
            if !key_type.is_valid_key() {
                return Err(CodecError::NotSerializable {
                    type_name: ty.to_string(),
                });
            }
            for (key, entry_value) in entries {
                let mut entry = Vec::new();
                put_bytes_field(&mut entry, 1, &encode(key, key_type, objects)?);
                put_bytes_field(&mut entry, 2, &encode(entry_value, value_type, objects)?);
                put_bytes_field(buf, 1, &entry);
            }
        }
        (TypeDesc::Message(kind), Value::Message(message)) => {
            if message.kind() != *kind {
                return Err(mismatch(value, ty));
            }
            buf.extend_from_slice(&message.encode());
        }
        _ => return Err(mismatch(value, ty)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::value::ObjectRef;

    fn enc(value: Value, ty: TypeDesc) -> Vec<u8> {
        encode(&value, &ty, &mut ObjectRegistry::new()).unwrap()
    }

    #[test]
    fn test_scalar_wire_forms() {
        assert_eq!(enc(Value::Int32(-1), TypeDesc::Int32), vec![0x01]);
        assert_eq!(enc(Value::UInt32(300), TypeDesc::UInt32), vec![0xAC, 0x02]);
        assert_eq!(enc(Value::Bool(true), TypeDesc::Bool), vec![0x01]);
        assert_eq!(enc(Value::Float(1.0), TypeDesc::Float), vec![0x00, 0x00, 0x80, 0x3F]);
        assert_eq!(
            enc(Value::from("jeb"), TypeDesc::String),
            vec![0x03, b'j', b'e', b'b']
        );
        assert_eq!(
            enc(Value::Enum(-2), TypeDesc::enumeration("E")),
            vec![0x03]
        );
    }

    #[test]
    fn test_empty_collections_are_zero_bytes() {
        assert!(enc(Value::List(vec![]), TypeDesc::list(TypeDesc::Int32)).is_empty());
        assert!(enc(Value::Set(vec![]), TypeDesc::set(TypeDesc::Int32)).is_empty());
        assert!(enc(
            Value::Dictionary(vec![]),
            TypeDesc::dictionary(TypeDesc::String, TypeDesc::Int32)
        )
        .is_empty());
    }

    #[test]
    fn test_list_layout() {
        let bytes = enc(
            Value::List(vec![Value::UInt32(1), Value::UInt32(2)]),
            TypeDesc::list(TypeDesc::UInt32),
        );
        assert_eq!(bytes, vec![0x0A, 0x01, 0x01, 0x0A, 0x01, 0x02]);
    }

    #[test]
    fn test_null_object_is_zero_handle() {
        assert_eq!(enc(Value::null_object(), TypeDesc::class("C")), vec![0x00]);
    }

    #[test]
    fn test_same_object_same_handle() {
        let mut objects = ObjectRegistry::new();
        let object = ObjectRef::new(String::from("vessel"));
        let ty = TypeDesc::class("Vessel");
        let first = encode(&Value::object(object.clone()), &ty, &mut objects).unwrap();
        let second = encode(&Value::object(object), &ty, &mut objects).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec![0x01]);
    }

    #[test]
    fn test_shape_mismatch_is_error() {
        let err = encode(
            &Value::Int32(1),
            &TypeDesc::Int64,
            &mut ObjectRegistry::new(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            CodecError::TypeMismatch {
                expected: "int64".into(),
                found: "int32".into()
            }
        );

        let err = encode(
            &Value::Tuple(vec![Value::Bool(true)]),
            &TypeDesc::Tuple(vec![TypeDesc::Bool, TypeDesc::Bool]),
            &mut ObjectRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }

    #[test]
    fn test_invalid_dictionary_key_not_serializable() {
        let err = encode(
            &Value::Dictionary(vec![]),
            &TypeDesc::dictionary(TypeDesc::class("C"), TypeDesc::Bool),
            &mut ObjectRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::NotSerializable { .. }));
    }
}
