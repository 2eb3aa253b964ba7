//! # datomdb codec
//!
//! Typed values for the datom model and the order-preserving byte codec
//! that turns them into B-tree keys.
//!
//! Every encoded value is a one-byte type tag followed by a per-type
//! encoding chosen so that the unsigned byte order of the encoded form
//! equals [`Value::cmp`] order. This is what gives the AVET index its
//! value sort and makes `index_range` a plain key-range scan.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod value;

pub use decoder::{decode_value, Decoder};
pub use encoder::{encode_value, Encoder};
pub use error::{CodecError, CodecResult};
pub use value::{Keyword, Value};

/// Maximum length in bytes of a single encoded value.
///
/// The engine caps keys at 511 bytes and every index key carries two
/// 8-byte id fields next to the value.
pub const MAX_ENCODED_LEN: usize = 495;
