//! Length-prefixed transport codec for JSON frames.
//!
//! Every frame is a single JSON object preceded by a 4-byte big-endian
//! length prefix for reliable delimitation over stream sockets.
//!
//! Frame format:
//! ```text
//! +----------------+------------------+
//! |  4 bytes       |  N bytes         |
//! |  (length BE)   |  (JSON object)   |
//! +----------------+------------------+
//! ```
//!
//! Decoding yields an untyped [`Value`]; callers turn it into an event or a
//! request so that a well-formed frame with an unknown `type` can be told
//! apart from transport corruption.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for length-prefixed JSON object frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    current_length: Option<usize>,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Value;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.current_length.is_none() {
            if src.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }

            let len = src.get_u32() as usize;

            if len > MAX_FRAME_SIZE {
                return Err(CodecError::FrameTooLarge(len));
            }

            self.current_length = Some(len);
        }

        let Some(length) = self.current_length else {
            return Ok(None);
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let payload = src.split_to(length);
        self.current_length = None;

        let json_str = std::str::from_utf8(&payload)?;
        let frame: Value = serde_json::from_str(json_str)?;
        if !frame.is_object() {
            return Err(CodecError::NotAnObject);
        }

        Ok(Some(frame))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec {
    type Error = CodecError;

    // Frame size is checked against MAX_FRAME_SIZE (fits in u32)
    #[allow(clippy::cast_possible_truncation)]
    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;

        if json.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(json.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);

        Ok(())
    }
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("Frame is not a JSON object")]
    NotAnObject,
}
