//! Value decoder.
//!
//! Every byte handed to [`decode`] must belong to the value: trailing bytes
//! are malformed, and a length prefix pointing past the end is truncated.

use super::types::TypeDesc;
use super::value::Value;
use super::wire::{expect_wire_type, zigzag_decode32, zigzag_decode64, WireReader, WireType};
use crate::messages::Message;
use crate::registry::ObjectRegistry;
use crate::CodecError;

/// Decode `bytes` against the declared type.
pub fn decode(bytes: &[u8], ty: &TypeDesc, objects: &ObjectRegistry) -> Result<Value, CodecError> {
    match ty {
        TypeDesc::Tuple(types) => decode_tuple(bytes, types, objects),
        TypeDesc::List(element) => Ok(Value::List(decode_items(bytes, element, objects)?)),
        TypeDesc::Set(element) => Ok(Value::set_from(decode_items(bytes, element, objects)?)),
        TypeDesc::Dictionary(key, value) => decode_dictionary(bytes, ty, key, value, objects),
        TypeDesc::Message(kind) => Ok(Value::from(Message::decode(*kind, bytes)?)),
        // Zero bytes stand for an absent object.
        TypeDesc::Class(_) if bytes.is_empty() => Ok(Value::null_object()),
        _ => {
            let mut reader = WireReader::new(bytes);
            let value = decode_scalar(&mut reader, ty, objects)?;
            reader.finish()?;
            Ok(value)
        }
    }
}

fn decode_scalar(
    reader: &mut WireReader<'_>,
    ty: &TypeDesc,
    objects: &ObjectRegistry,
) -> Result<Value, CodecError> {
    Ok(match ty {
        TypeDesc::Enum(_) => Value::Enum(zigzag_decode32(reader.read_varint_u32()?)),
        TypeDesc::Double => Value::Double(reader.read_f64()?),
        TypeDesc::Float => Value::Float(reader.read_f32()?),
        TypeDesc::Int32 => Value::Int32(zigzag_decode32(reader.read_varint_u32()?)),
        TypeDesc::Int64 => Value::Int64(zigzag_decode64(reader.read_varint()?)),
        TypeDesc::UInt32 => Value::UInt32(reader.read_varint_u32()?),
        TypeDesc::UInt64 => Value::UInt64(reader.read_varint()?),
        TypeDesc::Bool => Value::Bool(reader.read_bool()?),
        TypeDesc::String => Value::String(reader.read_string()?),
        TypeDesc::Bytes => Value::Bytes(reader.read_length_delimited()?.to_vec()),
        TypeDesc::Class(_) => {
            let handle = reader.read_varint()?;
            Value::Object(objects.resolve(handle)?)
        }
        other => {
            return Err(CodecError::NotSerializable {
                type_name: other.to_string(),
            })
        }
    })
}

/// Read the repeated field 1 that carries collection elements.
fn read_elements(bytes: &[u8]) -> Result<Vec<&[u8]>, CodecError> {
    let mut reader = WireReader::new(bytes);
    let mut elements = Vec::new();
    while !reader.is_empty() {
        let (field, wire_type) = reader.read_tag()?;
        if field != 1 {
            reader.skip(wire_type)?;
            continue;
        }
        expect_wire_type(field, wire_type, WireType::LengthDelimited)?;
        elements.push(reader.read_length_delimited()?);
    }
    Ok(elements)
}

fn decode_items(
    bytes: &[u8],
    element: &TypeDesc,
    objects: &ObjectRegistry,
) -> Result<Vec<Value>, CodecError> {
    read_elements(bytes)?
        .into_iter()
        .map(|item| decode(item, element, objects))
        .collect()
}

fn decode_tuple(
    bytes: &[u8],
    types: &[TypeDesc],
    objects: &ObjectRegistry,
) -> Result<Value, CodecError> {
    let elements = read_elements(bytes)?;
    if elements.len() != types.len() {
        return Err(CodecError::malformed(format!(
            "tuple has {} elements, expected {}",
            elements.len(),
            types.len()
        )));
    }
    elements
        .into_iter()
        .zip(types)
        .map(|(item, ty)| decode(item, ty, objects))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Tuple)
}

fn decode_dictionary(
    bytes: &[u8],
    ty: &TypeDesc,
    key_type: &TypeDesc,
    value_type: &TypeDesc,
    objects: &ObjectRegistry,
) -> Result<Value, CodecError> {
    if !key_type.is_valid_key() {
        return Err(CodecError::NotSerializable {
            type_name: ty.to_string(),
        });
    }
    let mut entries = Vec::new();
    for entry in read_elements(bytes)? {
        let mut key: &[u8] = &[];
        let mut value: &[u8] = &[];
        let mut reader = WireReader::new(entry);
        while !reader.is_empty() {
            let (field, wire_type) = reader.read_tag()?;
            match field {
                1 | 2 => {
                    expect_wire_type(field, wire_type, WireType::LengthDelimited)?;
                    let bytes = reader.read_length_delimited()?;
                    if field == 1 {
                        key = bytes;
                    } else {
                        value = bytes;
                    }
                }
                _ => reader.skip(wire_type)?,
            }
        }
        entries.push((
            decode(key, key_type, objects)?,
            decode(value, value_type, objects)?,
        ));
    }
    Ok(Value::dictionary_from(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encoder::encode;
    use crate::codec::types::MessageKind;
    use crate::codec::value::ObjectRef;
    use crate::messages::{Request, Response, Status};

    fn round_trip(value: Value, ty: TypeDesc) {
        let mut objects = ObjectRegistry::new();
        let bytes = encode(&value, &ty, &mut objects).unwrap();
        let decoded = decode(&bytes, &ty, &objects).unwrap();
        assert_eq!(decoded, value, "round trip through {}", ty);
    }

    #[test]
    fn test_scalar_round_trips() {
        round_trip(Value::Double(-1.25e300), TypeDesc::Double);
        round_trip(Value::Float(f32::MIN_POSITIVE), TypeDesc::Float);
        round_trip(Value::Int32(i32::MIN), TypeDesc::Int32);
        round_trip(Value::Int64(i64::MAX), TypeDesc::Int64);
        round_trip(Value::UInt32(u32::MAX), TypeDesc::UInt32);
        round_trip(Value::UInt64(u64::MAX), TypeDesc::UInt64);
        round_trip(Value::Bool(false), TypeDesc::Bool);
        round_trip(Value::from("Jebediah Kerman \u{1F680}"), TypeDesc::String);
        round_trip(Value::from(""), TypeDesc::String);
        round_trip(Value::Bytes(vec![0, 1, 0, 255, 0]), TypeDesc::Bytes);
        round_trip(Value::Enum(-7), TypeDesc::enumeration("SpaceCenter.Situation"));
    }

    #[test]
    fn test_nested_collections_round_trip() {
        let ty = TypeDesc::Tuple(vec![
            TypeDesc::list(TypeDesc::set(TypeDesc::Int32)),
            TypeDesc::dictionary(TypeDesc::String, TypeDesc::list(TypeDesc::Double)),
            TypeDesc::Bytes,
        ]);
        let value = Value::Tuple(vec![
            Value::List(vec![
                Value::Set(vec![Value::Int32(3), Value::Int32(-3)]),
                Value::Set(vec![]),
            ]),
            Value::Dictionary(vec![
                (Value::from("a"), Value::List(vec![Value::Double(1.0)])),
                (Value::from("b"), Value::List(vec![])),
            ]),
            Value::Bytes(vec![]),
        ]);
        round_trip(value, ty);
    }

    #[test]
    fn test_empty_collections_round_trip() {
        round_trip(Value::List(vec![]), TypeDesc::list(TypeDesc::String));
        round_trip(Value::Set(vec![]), TypeDesc::set(TypeDesc::UInt64));
        round_trip(
            Value::Dictionary(vec![]),
            TypeDesc::dictionary(TypeDesc::enumeration("E"), TypeDesc::Bool),
        );
    }

    #[test]
    fn test_message_round_trip() {
        let request = Request::new("KRPC", "GetStatus");
        round_trip(
            Value::from(Message::Request(request)),
            TypeDesc::Message(MessageKind::Request),
        );
        let status = Status {
            version: "0.6.0".into(),
            rpcs_executed: 12,
            ..Status::default()
        };
        round_trip(
            Value::from(Message::Status(status)),
            TypeDesc::Message(MessageKind::Status),
        );
        round_trip(
            Value::from(Message::Response(Response::error(2.0, "nope"))),
            TypeDesc::Message(MessageKind::Response),
        );
    }

    #[test]
    fn test_objects_round_trip() {
        let mut objects = ObjectRegistry::new();
        let vessel = ObjectRef::new(42u64);
        let ty = TypeDesc::list(TypeDesc::class("Vessel"));
        let value = Value::List(vec![
            Value::object(vessel.clone()),
            Value::null_object(),
            Value::object(vessel.clone()),
        ]);
        let bytes = encode(&value, &ty, &mut objects).unwrap();
        assert_eq!(objects.len(), 1);
        let decoded = decode(&bytes, &ty, &objects).unwrap();
        assert_eq!(decoded, value);
        match decoded {
            Value::List(items) => assert!(items[0].as_object().unwrap().ptr_eq(&vessel)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_zero_bytes_is_null_object() {
        let value = decode(&[], &TypeDesc::class("Vessel"), &ObjectRegistry::new()).unwrap();
        assert_eq!(value, Value::null_object());
    }

    #[test]
    fn test_unknown_handle() {
        let err = decode(&[0x05], &TypeDesc::class("Vessel"), &ObjectRegistry::new()).unwrap_err();
        assert_eq!(err, CodecError::UnknownHandle(5));
    }

    #[test]
    fn test_set_decoding_deduplicates() {
        // Set(int32) holding 1, 1, 2
        let bytes = [0x0A, 0x01, 0x02, 0x0A, 0x01, 0x02, 0x0A, 0x01, 0x04];
        let value = decode(&bytes, &TypeDesc::set(TypeDesc::Int32), &ObjectRegistry::new()).unwrap();
        match value {
            Value::Set(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_length_past_end_is_truncated() {
        // string claiming 10 bytes with only 2 present
        let err = decode(&[0x0A, b'h', b'i'], &TypeDesc::String, &ObjectRegistry::new())
            .unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));

        let err = decode(
            &[0x0A, 0x09, 0x01],
            &TypeDesc::list(TypeDesc::Int32),
            &ObjectRegistry::new(),
        )
        .unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let err = decode(&[0x01, 0x01], &TypeDesc::Bool, &ObjectRegistry::new()).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_bool_alternate_encoding_rejected() {
        assert!(decode(&[0x02], &TypeDesc::Bool, &ObjectRegistry::new()).is_err());
    }

    #[test]
    fn test_padded_bool_rejected() {
        assert!(decode(&[0x81, 0x00], &TypeDesc::Bool, &ObjectRegistry::new()).is_err());
        assert!(decode(&[0x80, 0x00], &TypeDesc::Bool, &ObjectRegistry::new()).is_err());
    }

    #[test]
    fn test_empty_scalar_is_error() {
        assert!(decode(&[], &TypeDesc::Double, &ObjectRegistry::new()).is_err());
        assert!(decode(&[], &TypeDesc::Int32, &ObjectRegistry::new()).is_err());
    }

    #[test]
    fn test_tuple_arity_mismatch() {
        let ty = TypeDesc::Tuple(vec![TypeDesc::Bool, TypeDesc::Bool]);
        let err = decode(&[0x0A, 0x01, 0x01], &ty, &ObjectRegistry::new()).unwrap_err();
        assert!(matches!(err, CodecError::Malformed { .. }));
    }

    #[test]
    fn test_padded_varint_decodes_equal() {
        let plain = decode(&[0x01], &TypeDesc::UInt32, &ObjectRegistry::new()).unwrap();
        let padded = decode(&[0x81, 0x00], &TypeDesc::UInt32, &ObjectRegistry::new()).unwrap();
        assert_eq!(plain, padded);
    }
}
