//! Incremental decoder for the AWS event-stream binary framing used by the
//! upstream streaming endpoint.
//!
//! Frame layout (all integers big-endian):
//! `total_len:u32 | headers_len:u32 | prelude_crc:u32 | headers | payload | message_crc:u32`.
//! Checksums are skipped; frames are delimited by the length prefix alone.

use bytes::{Buf, Bytes, BytesMut};

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + TRAILER_LEN;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length {0} out of range")]
    BadLength(usize),
    #[error("headers length {headers} exceeds frame body {body}")]
    BadHeadersLength { headers: usize, body: usize },
    #[error("truncated header block")]
    TruncatedHeader,
    #[error("unknown header value type {0}")]
    UnknownHeaderType(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Bytes),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Bytes,
}

impl Frame {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|(key, value)| match value {
            HeaderValue::String(text) if key == name => Some(text.as_str()),
            _ => None,
        })
    }

    /// `:event-type`, e.g. `assistantResponseEvent`.
    pub fn event_type(&self) -> Option<&str> {
        self.header_str(":event-type")
    }

    /// `:message-type`, `event` or `exception`.
    pub fn message_type(&self) -> Option<&str> {
        self.header_str(":message-type")
    }
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every frame completed so far. Partial
    /// frames stay buffered until the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while self.buffer.len() >= PRELUDE_LEN {
            let total = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total) {
                return Err(FrameError::BadLength(total));
            }
            if self.buffer.len() < total {
                break;
            }
            let mut frame = self.buffer.split_to(total).freeze();
            frames.push(decode_frame(&mut frame, total)?);
        }
        Ok(frames)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_frame(frame: &mut Bytes, total: usize) -> Result<Frame, FrameError> {
    frame.advance(4);
    let headers_len = frame.get_u32() as usize;
    frame.advance(4);
    let body = total - MIN_FRAME_LEN;
    if headers_len > body {
        return Err(FrameError::BadHeadersLength {
            headers: headers_len,
            body,
        });
    }
    let mut header_block = frame.split_to(headers_len);
    let payload = frame.split_to(body - headers_len);
    let headers = decode_headers(&mut header_block)?;
    Ok(Frame { headers, payload })
}

fn decode_headers(block: &mut Bytes) -> Result<Vec<(String, HeaderValue)>, FrameError> {
    let mut headers = Vec::new();
    while block.has_remaining() {
        let name_len = block.get_u8() as usize;
        need(block, name_len + 1)?;
        let name = String::from_utf8_lossy(&block.split_to(name_len)).into_owned();
        let kind = block.get_u8();
        let value = match kind {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => {
                need(block, 1)?;
                HeaderValue::Byte(block.get_i8())
            }
            3 => {
                need(block, 2)?;
                HeaderValue::Short(block.get_i16())
            }
            4 => {
                need(block, 4)?;
                HeaderValue::Int(block.get_i32())
            }
            5 => {
                need(block, 8)?;
                HeaderValue::Long(block.get_i64())
            }
            6 | 7 => {
                need(block, 2)?;
                let len = block.get_u16() as usize;
                need(block, len)?;
                let raw = block.split_to(len);
                if kind == 6 {
                    HeaderValue::Bytes(raw)
                } else {
                    HeaderValue::String(String::from_utf8_lossy(&raw).into_owned())
                }
            }
            8 => {
                need(block, 8)?;
                HeaderValue::Timestamp(block.get_i64())
            }
            9 => {
                need(block, 16)?;
                let mut uuid = [0u8; 16];
                block.copy_to_slice(&mut uuid);
                HeaderValue::Uuid(uuid)
            }
            other => return Err(FrameError::UnknownHeaderType(other)),
        };
        headers.push((name, value));
    }
    Ok(headers)
}

fn need(block: &Bytes, len: usize) -> Result<(), FrameError> {
    if block.remaining() < len {
        return Err(FrameError::TruncatedHeader);
    }
    Ok(())
}

/// Encodes a frame with string headers. Checksum fields are zeroed.
pub fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Bytes {
    let mut header_block = Vec::new();
    for (name, value) in headers {
        header_block.push(name.len() as u8);
        header_block.extend_from_slice(name.as_bytes());
        header_block.push(7);
        header_block.extend_from_slice(&(value.len() as u16).to_be_bytes());
        header_block.extend_from_slice(value.as_bytes());
    }
    let total = MIN_FRAME_LEN + header_block.len() + payload.len();
    let mut out = BytesMut::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(&(header_block.len() as u32).to_be_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&header_block);
    out.extend_from_slice(payload);
    out.extend_from_slice(&[0; 4]);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_split_at_every_offset() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(
            &[(":event-type", "assistantResponseEvent"), (":message-type", "event")],
            br#"{"content":"hi"}"#,
        ));
        wire.extend_from_slice(&encode_frame(
            &[(":event-type", "messageStopEvent")],
            b"{}",
        ));

        for split in 0..wire.len() {
            let mut decoder = EventStreamDecoder::new();
            let mut frames = decoder.push(&wire[..split]).unwrap();
            frames.extend(decoder.push(&wire[split..]).unwrap());
            assert_eq!(frames.len(), 2, "split at {split}");
            assert_eq!(frames[0].event_type(), Some("assistantResponseEvent"));
            assert_eq!(frames[0].message_type(), Some("event"));
            assert_eq!(&frames[0].payload[..], br#"{"content":"hi"}"#);
            assert_eq!(frames[1].event_type(), Some("messageStopEvent"));
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn rejects_impossible_length() {
        let mut decoder = EventStreamDecoder::new();
        let err = decoder.push(&[0, 0, 0, 4, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, FrameError::BadLength(4));
    }
}
