//! Value decoder — the round-trip inverse of the encoder.

use chrono::DateTime;
use uuid::Uuid;

use crate::encoder::{unflip_f32, unflip_f64, unflip_i64};
use crate::error::{CodecError, CodecResult};
use crate::value::{tag, Keyword, Value};

/// Decode a single value, requiring the whole input to be consumed.
///
/// # Errors
///
/// Returns an error on truncated input, an unknown tag, malformed
/// content, or trailing bytes.
pub fn decode_value(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.take_value()?;
    if !decoder.remaining().is_empty() {
        return Err(CodecError::TrailingBytes {
            count: decoder.remaining().len(),
        });
    }
    Ok(value)
}

/// A streaming decoder over a byte slice.
///
/// Index keys interleave fixed-width id fields with one encoded value,
/// so the decoder exposes both and tracks how much it consumed.
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Creates a decoder over the input slice.
    #[must_use]
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    /// The unconsumed tail of the input.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.input[self.pos..]
    }

    /// Reads a raw big-endian u64 id field.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than 8 bytes remain.
    pub fn take_u64(&mut self) -> CodecResult<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("8-byte slice")))
    }

    /// Reads one tagged value.
    ///
    /// # Errors
    ///
    /// Returns an error on truncated input, an unknown tag, or malformed
    /// content.
    pub fn take_value(&mut self) -> CodecResult<Value> {
        let tag_byte = self.take(1)?[0];
        match tag_byte {
            tag::LONG => Ok(Value::Long(self.take_flipped_i64()?)),
            tag::DOUBLE => {
                let bytes = self.take(8)?;
                Ok(Value::Double(unflip_f64(
                    bytes.try_into().expect("8-byte slice"),
                )))
            }
            tag::FLOAT => {
                let bytes = self.take(4)?;
                Ok(Value::Float(unflip_f32(
                    bytes.try_into().expect("4-byte slice"),
                )))
            }
            tag::REF => Ok(Value::Ref(self.take_flipped_i64()? as u64)),
            tag::INSTANT => {
                let millis = self.take_flipped_i64()?;
                DateTime::from_timestamp_millis(millis)
                    .map(Value::Instant)
                    .ok_or(CodecError::InstantOutOfRange { millis })
            }
            tag::KEYWORD => Ok(Value::Keyword(Keyword::new(self.take_terminated()?))),
            tag::SYMBOL => Ok(Value::Symbol(self.take_terminated()?.to_string())),
            tag::STR => Ok(Value::Str(self.take_terminated()?.to_string())),
            tag::UUID => {
                let bytes = self.take(16)?;
                Ok(Value::Uuid(Uuid::from_slice(bytes).expect("16-byte slice")))
            }
            tag::BOOL => match self.take(1)?[0] {
                0x01 => Ok(Value::Bool(true)),
                0x02 => Ok(Value::Bool(false)),
                byte => Err(CodecError::InvalidBool { byte }),
            },
            tag::BYTES => {
                let len_bytes = self.take(2)?;
                let len = u16::from_be_bytes(len_bytes.try_into().expect("2-byte slice"));
                Ok(Value::Bytes(self.take(len as usize)?.to_vec()))
            }
            other => Err(CodecError::UnknownTag { tag: other }),
        }
    }

    fn take(&mut self, n: usize) -> CodecResult<&'a [u8]> {
        if self.input.len() - self.pos < n {
            return Err(CodecError::UnexpectedEnd);
        }
        let slice = &self.input[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_flipped_i64(&mut self) -> CodecResult<i64> {
        let bytes = self.take(8)?;
        Ok(unflip_i64(bytes.try_into().expect("8-byte slice")))
    }

    fn take_terminated(&mut self) -> CodecResult<&'a str> {
        let rest = &self.input[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(CodecError::MissingTerminator)?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| CodecError::InvalidUtf8)?;
        self.pos += nul + 1;
        Ok(s)
    }
}
