//! NSQ TCP protocol (V2) framing.
//!
//! Server → client frames are `u32 size | i32 frame type | data`, where
//! `size` counts the type field. Message frames carry
//! `i64 timestamp | u16 attempts | 16-byte id | body`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::core::broker::MessageId;
use crate::core::error::BrokerError;

pub const MAGIC_V2: &[u8] = b"  V2";

pub const FRAME_TYPE_RESPONSE: i32 = 0;
pub const FRAME_TYPE_ERROR: i32 = 1;
pub const FRAME_TYPE_MESSAGE: i32 = 2;

pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

pub const MSG_ID_LENGTH: usize = 16;
const MESSAGE_HEADER_LENGTH: usize = 8 + 2 + MSG_ID_LENGTH;

/// Frames larger than this are treated as corruption.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsqMessage {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(NsqMessage),
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(data) if &data[..] == HEARTBEAT)
    }
}

/// Client → server commands used by the delay service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Pub { topic: String, body: Bytes },
    Nop,
    Cls,
}

impl Command {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Command::Identify(body) => {
                buf.put_slice(b"IDENTIFY\n");
                put_sized(buf, body);
            }
            Command::Sub { topic, channel } => {
                buf.put_slice(b"SUB ");
                buf.put_slice(topic.as_bytes());
                buf.put_u8(b' ');
                buf.put_slice(channel.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Rdy(count) => {
                buf.put_slice(format!("RDY {count}\n").as_bytes());
            }
            Command::Fin(id) => {
                buf.put_slice(b"FIN ");
                buf.put_slice(id.0.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Pub { topic, body } => {
                buf.put_slice(b"PUB ");
                buf.put_slice(topic.as_bytes());
                buf.put_u8(b'\n');
                put_sized(buf, body);
            }
            Command::Nop => buf.put_slice(b"NOP\n"),
            Command::Cls => buf.put_slice(b"CLS\n"),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

fn put_sized(buf: &mut BytesMut, body: &[u8]) {
    buf.reserve(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
}

/// Body of the `IDENTIFY` command. Feature negotiation stays off so the
/// server answers with a plain `OK`.
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub heartbeat_interval: i64,
    pub feature_negotiation: bool,
}

impl Identify {
    pub fn for_host(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        let client_id = hostname.split('.').next().unwrap_or_default().to_string();
        Self {
            client_id,
            hostname,
            user_agent: concat!("nsqdelay/", env!("CARGO_PKG_VERSION")).to_string(),
            heartbeat_interval: 30_000,
            feature_negotiation: false,
        }
    }

    pub fn to_command(&self) -> Result<Command, BrokerError> {
        let body = serde_json::to_vec(self)
            .map_err(|e| BrokerError::Protocol(format!("encode IDENTIFY: {e}")))?;
        Ok(Command::Identify(Bytes::from(body)))
    }
}

impl Default for Identify {
    fn default() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self::for_host(host)
    }
}

/// Decodes the data part of a frame.
pub fn decode_frame(frame_type: i32, mut data: Bytes) -> Result<Frame, BrokerError> {
    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
        FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
        FRAME_TYPE_MESSAGE => {
            if data.len() < MESSAGE_HEADER_LENGTH {
                return Err(BrokerError::Protocol(format!(
                    "message frame too short: {} bytes",
                    data.len()
                )));
            }
            let timestamp = data.get_i64();
            let attempts = data.get_u16();
            let id = data.split_to(MSG_ID_LENGTH);
            Ok(Frame::Message(NsqMessage {
                timestamp,
                attempts,
                id: MessageId(String::from_utf8_lossy(&id).into_owned()),
                body: data,
            }))
        }
        other => Err(BrokerError::Protocol(format!("unknown frame type {other}"))),
    }
}

/// Extracts one size-prefixed frame from `buf`, or `None` if more bytes
/// are needed.
pub fn extract_frame(buf: &mut BytesMut) -> Option<Result<Frame, BrokerError>> {
    if buf.len() < 4 {
        return None;
    }

    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if !(4..=MAX_FRAME_SIZE).contains(&size) {
        return Some(Err(BrokerError::Protocol(format!("invalid frame size {size}"))));
    }
    if buf.len() < 4 + size {
        return None;
    }

    buf.advance(4);
    let mut frame = buf.split_to(size).freeze();
    let frame_type = frame.get_i32();
    Some(decode_frame(frame_type, frame))
}
