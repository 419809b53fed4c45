//! Length-prefixed CBOR framing for the control connection.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{KeeperError, KeeperResult};
use std::io::Cursor;

/// Largest payload accepted from a peer (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> KeeperResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(KeeperError::Codec(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> KeeperResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return all complete decoded messages.
    ///
    /// Fails if a peer announces a frame larger than [`MAX_FRAME_LEN`].
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> KeeperResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        while self.buffer.len() >= 4 {
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(KeeperError::Codec(format!(
                    "peer announced {len}-byte frame, limit is {MAX_FRAME_LEN}"
                )));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            let msg: T = cbor_decode(&self.buffer[4..4 + len])?;
            messages.push(msg);
            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    /// Number of bytes buffered but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
