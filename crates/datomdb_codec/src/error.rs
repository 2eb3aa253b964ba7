//! Error types for the codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding values.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A string-like value contained an interior NUL byte, which is
    /// reserved as the terminator in the encoded form.
    #[error("{kind} value contains a NUL byte")]
    NulByte {
        /// The value type that was being encoded.
        kind: &'static str,
    },

    /// The encoded form exceeds the maximum key-value length.
    #[error("encoded value is {len} bytes, maximum is {max}")]
    ValueTooLarge {
        /// Actual encoded length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The input ended before a complete value was decoded.
    #[error("unexpected end of input while decoding")]
    UnexpectedEnd,

    /// The type tag byte is not one the codec knows.
    #[error("unknown type tag {tag:#04x}")]
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
    },

    /// A string-like value was not valid UTF-8.
    #[error("encoded string is not valid UTF-8")]
    InvalidUtf8,

    /// A string-like value had no NUL terminator.
    #[error("encoded string is missing its terminator")]
    MissingTerminator,

    /// A boolean byte was neither 0x01 nor 0x02.
    #[error("invalid boolean byte {byte:#04x}")]
    InvalidBool {
        /// The offending byte.
        byte: u8,
    },

    /// An instant's millisecond value is outside the representable range.
    #[error("instant out of range: {millis} ms")]
    InstantOutOfRange {
        /// Milliseconds since the epoch.
        millis: i64,
    },

    /// Bytes remained after a whole-input decode.
    #[error("{count} trailing bytes after decoded value")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },
}
