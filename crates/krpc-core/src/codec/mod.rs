//! Value codec.
//!
//! Values are encoded against a declared [`TypeDesc`], never inferred from
//! the bytes. See [`encoder`] and [`decoder`] for the two directions.

pub mod decoder;
pub mod encoder;
pub mod types;
pub mod value;
pub mod wire;

pub use decoder::decode;
pub use encoder::{encode, encode_optional};
pub use types::{MessageKind, TypeDesc};
pub use value::{ObjectRef, Value};
