use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;

/// Incremental decoder for a stream of concatenated JSON values, as produced
/// by the chunked list and watch responses. Transport chunk boundaries carry
/// no meaning: a value may span several chunks and one chunk may hold several
/// values, so the decoder buffers input and yields values as they complete.
#[derive(Default)]
pub struct JsonStreamDecoder {
    buf: BytesMut,
}

impl JsonStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode the next complete value out of the buffer, or `None` when more
    /// input is needed.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, serde_json::Error> {
        let mut values = serde_json::Deserializer::from_slice(&self.buf).into_iter::<T>();
        match values.next() {
            None => Ok(None),
            Some(Ok(value)) => {
                let consumed = values.byte_offset();
                self.buf.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(err)) if err.is_eof() => Ok(None),
            Some(Err(err)) => Err(err),
        }
    }

    /// True when no undecoded bytes remain (trailing whitespace ignored).
    pub fn is_drained(&self) -> bool {
        self.buf.iter().all(|b| b.is_ascii_whitespace())
    }
}
