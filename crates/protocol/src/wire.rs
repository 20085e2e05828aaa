//! Producer IPC wire format.
//!
//! Every message on the producer socket is framed as:
//! ```text
//! [0]      message type: 0x01 video, 0x02 audio, 0x03 metadata
//! [1..5]   region length N (u32 big-endian, at most 100 MiB)
//! [5..5+N] UTF-8 JSON header, optionally followed by a single 0x00
//!          separator byte and the binary payload
//! ```
//!
//! The JSON/payload boundary is found by scanning the region for the first
//! 0x00 byte. JSON text never contains a raw NUL, so producers that carry a
//! binary payload must write the separator. When no 0x00 exists the region
//! is split at the closing brace of the outermost JSON object (string
//! escapes respected). Metadata messages carry no binary payload.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::sample::{AudioSample, StreamMetadata, VideoCodec, VideoSample};

/// Hard cap on the declared region length.
pub const MAX_MESSAGE_LEN: u32 = 100 * 1024 * 1024;

/// Byte separating the JSON header from the binary payload.
pub const HEADER_SEPARATOR: u8 = 0x00;

/// Message type byte plus the big-endian u32 region length.
pub const MESSAGE_PREFIX_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Video = 0x01,
    Audio = 0x02,
    Metadata = 0x03,
}

impl MessageType {
    pub fn from_byte(byte: u8) -> Result<Self, WireError> {
        match byte {
            0x01 => Ok(MessageType::Video),
            0x02 => Ok(MessageType::Audio),
            0x03 => Ok(MessageType::Metadata),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("declared length {0} exceeds the {MAX_MESSAGE_LEN}-byte cap")]
    TooLarge(u32),
    #[error("stream ended mid-message ({got} of {expected} bytes)")]
    Truncated { expected: usize, got: usize },
    #[error("bad JSON header: {0}")]
    BadJson(String),
    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),
}

/// Reject a declared region length above the cap before allocating for it.
pub fn validate_length(len: u32) -> Result<(), WireError> {
    if len > MAX_MESSAGE_LEN {
        return Err(WireError::TooLarge(len));
    }
    Ok(())
}

/// JSON header of a video message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoHeader {
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
    pub width: u32,
    pub height: u32,
    pub codec: VideoCodec,
}

impl VideoHeader {
    pub fn into_sample(self, payload: Bytes) -> VideoSample {
        VideoSample {
            pts: self.pts,
            dts: self.dts,
            keyframe: self.keyframe,
            width: self.width,
            height: self.height,
            codec: self.codec,
            payload,
            received_at: std::time::Instant::now(),
        }
    }
}

/// JSON header of an audio message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioHeader {
    pub pts: i64,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_count: u32,
}

impl AudioHeader {
    pub fn into_sample(self, payload: Bytes) -> AudioSample {
        AudioSample {
            pts: self.pts,
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_count: self.sample_count,
            payload,
            received_at: std::time::Instant::now(),
        }
    }
}

/// A decoded producer message, independent of receive-time bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Video { header: VideoHeader, payload: Bytes },
    Audio { header: AudioHeader, payload: Bytes },
    Metadata(StreamMetadata),
}

impl WireMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            WireMessage::Video { .. } => MessageType::Video,
            WireMessage::Audio { .. } => MessageType::Audio,
            WireMessage::Metadata(_) => MessageType::Metadata,
        }
    }

    /// Decode the region bytes of a message whose prefix has been read.
    pub fn decode(msg_type: MessageType, region: &[u8]) -> Result<Self, WireError> {
        let (json, payload) = split_header(region)?;
        match msg_type {
            MessageType::Video => {
                let header: VideoHeader = parse_json(json)?;
                Ok(WireMessage::Video {
                    header,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            MessageType::Audio => {
                let header: AudioHeader = parse_json(json)?;
                Ok(WireMessage::Audio {
                    header,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            MessageType::Metadata => {
                let meta: StreamMetadata = parse_json(json)?;
                Ok(WireMessage::Metadata(meta))
            }
        }
    }

    /// Serialize to the full on-wire form (prefix included). Video and audio
    /// messages always get the explicit 0x00 separator; metadata never does.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let (json, payload) = match self {
            WireMessage::Video { header, payload } => (to_json(header)?, Some(payload)),
            WireMessage::Audio { header, payload } => (to_json(header)?, Some(payload)),
            WireMessage::Metadata(meta) => (to_json(meta)?, None),
        };

        let region_len = json.len() + payload.map_or(0, |p| 1 + p.len());
        let region_len = u32::try_from(region_len).map_err(|_| WireError::TooLarge(u32::MAX))?;
        validate_length(region_len)?;

        let mut buf = Vec::with_capacity(MESSAGE_PREFIX_SIZE + region_len as usize);
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&region_len.to_be_bytes());
        buf.extend_from_slice(&json);
        if let Some(payload) = payload {
            buf.push(HEADER_SEPARATOR);
            buf.extend_from_slice(payload);
        }
        Ok(buf)
    }
}

fn parse_json<'a, T: Deserialize<'a>>(json: &'a [u8]) -> Result<T, WireError> {
    serde_json::from_slice(json).map_err(|e| WireError::BadJson(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    serde_json::to_vec(value).map_err(|e| WireError::BadJson(e.to_string()))
}

/// Split a message region into (JSON header, binary payload).
pub fn split_header(region: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    if let Some(idx) = region.iter().position(|&b| b == HEADER_SEPARATOR) {
        return Ok((&region[..idx], &region[idx + 1..]));
    }
    let end = json_object_end(region)
        .ok_or_else(|| WireError::BadJson("unterminated JSON object".into()))?;
    Ok((&region[..end], &region[end..]))
}

/// Index one past the closing brace of the outermost JSON object, or `None`
/// when the region does not start with a balanced object.
fn json_object_end(data: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut started = false;

    for (i, &b) in data.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                depth += 1;
                started = true;
            }
            b'}' => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {
                if !started && !b.is_ascii_whitespace() {
                    return None;
                }
            }
        }
    }
    None
}
