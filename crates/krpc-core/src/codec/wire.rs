//! Low-level wire primitives.
//!
//! Base-128 varints, zig-zag signed integers, little-endian fixed-width
//! floats and tagged length-delimited fields, laid out the way protobuf lays
//! them out. Everything above this module (values, messages, framing) is
//! built from these pieces.

use crate::CodecError;
use bytes::{Buf, BufMut};

/// A varint never needs more than ten bytes for a u64.
pub const MAX_VARINT_LENGTH: usize = 10;

/// Wire type carried in the low three bits of a field tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    fn bits(self) -> u64 {
        match self {
            WireType::Varint => 0,
            WireType::Fixed64 => 1,
            WireType::LengthDelimited => 2,
            WireType::Fixed32 => 5,
        }
    }

    fn from_bits(bits: u64) -> Result<Self, CodecError> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(CodecError::malformed(format!("unsupported wire type {}", other))),
        }
    }
}

pub fn zigzag_encode32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

pub fn zigzag_decode32(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

pub fn zigzag_encode64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode64(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Number of bytes `put_varint` writes for `value`.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

pub fn put_varint<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

pub fn put_tag<B: BufMut>(buf: &mut B, field: u32, wire_type: WireType) {
    put_varint(buf, (u64::from(field) << 3) | wire_type.bits());
}

/// Write a varint length prefix followed by the bytes themselves.
pub fn put_length_delimited<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    put_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn put_bytes_field<B: BufMut>(buf: &mut B, field: u32, bytes: &[u8]) {
    put_tag(buf, field, WireType::LengthDelimited);
    put_length_delimited(buf, bytes);
}

pub fn put_string_field<B: BufMut>(buf: &mut B, field: u32, value: &str) {
    put_bytes_field(buf, field, value.as_bytes());
}

pub fn put_varint_field<B: BufMut>(buf: &mut B, field: u32, value: u64) {
    put_tag(buf, field, WireType::Varint);
    put_varint(buf, value);
}

pub fn put_bool_field<B: BufMut>(buf: &mut B, field: u32, value: bool) {
    put_varint_field(buf, field, u64::from(value));
}

pub fn put_double_field<B: BufMut>(buf: &mut B, field: u32, value: f64) {
    put_tag(buf, field, WireType::Fixed64);
    buf.put_f64_le(value);
}

pub fn put_float_field<B: BufMut>(buf: &mut B, field: u32, value: f32) {
    put_tag(buf, field, WireType::Fixed32);
    buf.put_f32_le(value);
}

/// Prefix `payload` with its varint length, the steady-state message framing.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(varint_len(payload.len() as u64) + payload.len());
    put_length_delimited(&mut out, payload);
    out
}

/// Cursor over a borrowed byte slice that never reads past its end.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn require(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_varint(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        for i in 0..MAX_VARINT_LENGTH {
            self.require(1)?;
            let byte = self.buf.get_u8();
            let bits = u64::from(byte & 0x7F);
            if i == MAX_VARINT_LENGTH - 1 && bits > 1 {
                return Err(CodecError::malformed("varint overflows 64 bits"));
            }
            value |= bits << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::malformed("varint longer than 10 bytes"))
    }

    pub fn read_varint_u32(&mut self) -> Result<u32, CodecError> {
        let value = self.read_varint()?;
        u32::try_from(value)
            .map_err(|_| CodecError::malformed(format!("varint {} overflows 32 bits", value)))
    }

    /// Read a bool: exactly one byte, 0x00 or 0x01. Padded varint forms
    /// are rejected.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            other => Err(CodecError::malformed(format!("invalid bool value {}", other))),
        }
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        self.require(8)?;
        Ok(self.buf.get_f64_le())
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        self.require(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    /// Read a varint length prefix and borrow that many bytes.
    pub fn read_length_delimited(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len)
            .map_err(|_| CodecError::malformed(format!("length {} too large", len)))?;
        self.require(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_length_delimited()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn read_tag(&mut self) -> Result<(u32, WireType), CodecError> {
        let key = self.read_varint()?;
        let field = key >> 3;
        if field == 0 || field > u64::from(u32::MAX >> 3) {
            return Err(CodecError::malformed(format!("invalid field number {}", field)));
        }
        Ok((field as u32, WireType::from_bits(key & 0x7)?))
    }

    /// Skip over the payload of a field whose tag has already been read.
    pub fn skip(&mut self, wire_type: WireType) -> Result<(), CodecError> {
        match wire_type {
            WireType::Varint => self.read_varint().map(|_| ()),
            WireType::Fixed64 => {
                self.require(8)?;
                self.buf.advance(8);
                Ok(())
            }
            WireType::Fixed32 => {
                self.require(4)?;
                self.buf.advance(4);
                Ok(())
            }
            WireType::LengthDelimited => self.read_length_delimited().map(|_| ()),
        }
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CodecError::malformed(format!(
                "{} unexpected trailing bytes",
                self.buf.len()
            )))
        }
    }
}

/// Require a specific wire type for a known field.
pub fn expect_wire_type(
    field: u32,
    actual: WireType,
    expected: WireType,
) -> Result<(), CodecError> {
    if actual != expected {
        return Err(CodecError::malformed(format!(
            "field {} has wire type {:?}, expected {:?}",
            field, actual, expected
        )));
    }
    Ok(())
}
