use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::NsqError;

// ═══════════════════════════════════════════════════════════════
//  Wire constants
// ═══════════════════════════════════════════════════════════════

/// Магия протокола V2, отправляется сразу после connect.
pub const MAGIC_V2: &[u8] = b"  V2";

pub const RESPONSE_OK: &[u8] = b"OK";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

/// timestamp(8) + attempts(2) + id(16)
const MESSAGE_HEADER_LEN: usize = 26;

// ═══════════════════════════════════════════════════════════════
//  MessageId
// ═══════════════════════════════════════════════════════════════

/// 16-байтовый ASCII идентификатор сообщения, выданный nsqd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageId(pub [u8; 16]);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

// ═══════════════════════════════════════════════════════════════
//  Commands (client → nsqd)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Rdy(u64),
    Fin(MessageId),
    Req { id: MessageId, delay: Duration },
    Touch(MessageId),
    Nop,
    Cls,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Nop => "NOP",
            Command::Cls => "CLS",
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Frames (nsqd → client)
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: MessageId,
    /// Наносекунды Unix epoch, когда nsqd принял сообщение.
    pub timestamp: i64,
    pub attempts: u16,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(RawMessage),
}

impl Frame {
    fn parse(frame_type: u32, mut data: Bytes) -> Result<Self, NsqError> {
        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
            FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
            FRAME_TYPE_MESSAGE => {
                if data.len() < MESSAGE_HEADER_LEN {
                    return Err(NsqError::Protocol(format!(
                        "message frame too short: {} bytes",
                        data.len()
                    )));
                }
                let timestamp = data.get_i64();
                let attempts = data.get_u16();
                let mut id = [0u8; 16];
                data.copy_to_slice(&mut id);
                Ok(Frame::Message(RawMessage {
                    id: MessageId(id),
                    timestamp,
                    attempts,
                    body: data,
                }))
            }
            other => Err(NsqError::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Codec
// ═══════════════════════════════════════════════════════════════

/// Кодек протокола V2: `size(u32) | type(u32) | data` на чтение,
/// текстовые команды на запись.
#[derive(Debug, Clone)]
pub struct NsqCodec {
    max_frame_size: usize,
}

impl NsqCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = NsqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, NsqError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size < 4 {
            return Err(NsqError::Protocol(format!("frame size {size} is smaller than its type header")));
        }
        if size > self.max_frame_size {
            return Err(NsqError::Protocol(format!(
                "frame size {size} exceeds max {}",
                self.max_frame_size
            )));
        }
        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = src.get_u32();
        let data = src.split_to(size - 4).freeze();
        Frame::parse(frame_type, data).map(Some)
    }
}

impl Encoder<Command> for NsqCodec {
    type Error = NsqError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), NsqError> {
        match cmd {
            Command::Identify(body) => {
                dst.put_slice(b"IDENTIFY\n");
                dst.put_u32(body.len() as u32);
                dst.put_slice(&body);
            }
            Command::Sub { topic, channel } => {
                dst.put_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Command::Rdy(count) => {
                dst.put_slice(format!("RDY {count}\n").as_bytes());
            }
            Command::Fin(id) => {
                dst.put_slice(b"FIN ");
                dst.put_slice(&id.0);
                dst.put_u8(b'\n');
            }
            Command::Req { id, delay } => {
                dst.put_slice(b"REQ ");
                dst.put_slice(&id.0);
                dst.put_slice(format!(" {}\n", delay.as_millis()).as_bytes());
            }
            Command::Touch(id) => {
                dst.put_slice(b"TOUCH ");
                dst.put_slice(&id.0);
                dst.put_u8(b'\n');
            }
            Command::Nop => dst.put_slice(b"NOP\n"),
            Command::Cls => dst.put_slice(b"CLS\n"),
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Names
// ═══════════════════════════════════════════════════════════════

/// Имя topic/channel: 1..=64 символов `[.a-zA-Z0-9_-]`,
/// допускается суффикс `#ephemeral`.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn frame(frame_type: u32, data: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32(4 + data.len() as u32);
        buf.put_u32(frame_type);
        buf.put_slice(data);
        buf
    }

    #[test]
    fn decodes_message_frame() {
        let mut data = Vec::new();
        data.extend_from_slice(&1_700_000_000_000_000_000i64.to_be_bytes());
        data.extend_from_slice(&3u16.to_be_bytes());
        data.extend_from_slice(b"0123456789abcdef");
        data.extend_from_slice(b"hello");
        let mut buf = frame(FRAME_TYPE_MESSAGE, &data);

        let got = NsqCodec::new(1024).decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            got,
            Frame::Message(RawMessage {
                id: MessageId(*b"0123456789abcdef"),
                timestamp: 1_700_000_000_000_000_000,
                attempts: 3,
                body: Bytes::from_static(b"hello"),
            })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_frame() {
        let full = frame(FRAME_TYPE_RESPONSE, b"_heartbeat_");
        let mut codec = NsqCodec::new(1024);

        let mut buf = BytesMut::from(&full[..7]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[7..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Response(Bytes::from_static(HEARTBEAT)))
        );
    }

    #[test]
    fn decodes_two_frames_from_one_buffer() {
        let mut buf = frame(FRAME_TYPE_ERROR, b"E_INVALID");
        buf.extend_from_slice(&frame(FRAME_TYPE_RESPONSE, b"OK"));
        let mut codec = NsqCodec::new(1024);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Error(Bytes::from_static(b"E_INVALID")))
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Frame::Response(Bytes::from_static(b"OK")))
        );
    }

    #[test]
    fn rejects_oversized_and_short_frames() {
        let mut big = frame(FRAME_TYPE_RESPONSE, &[0u8; 64]);
        assert!(NsqCodec::new(16).decode(&mut big).is_err());

        let mut short = frame(FRAME_TYPE_MESSAGE, b"tiny");
        assert!(NsqCodec::new(1024).decode(&mut short).is_err());
    }

    #[test]
    fn encodes_commands() {
        let id = MessageId(*b"0123456789abcdef");
        let mut codec = NsqCodec::new(1024);
        let mut dst = BytesMut::new();
        for cmd in [
            Command::Sub { topic: "LOG".into(), channel: "tailn".into() },
            Command::Rdy(128),
            Command::Fin(id),
            Command::Req { id, delay: Duration::from_secs(90) },
            Command::Nop,
            Command::Cls,
        ] {
            codec.encode(cmd, &mut dst).unwrap();
        }
        assert_eq!(
            &dst[..],
            &b"SUB LOG tailn\nRDY 128\nFIN 0123456789abcdef\nREQ 0123456789abcdef 90000\nNOP\nCLS\n"[..]
        );
    }

    #[test]
    fn encodes_identify_with_length_prefix() {
        let mut dst = BytesMut::new();
        NsqCodec::new(1024)
            .encode(Command::Identify(Bytes::from_static(b"{}")), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], &b"IDENTIFY\n\x00\x00\x00\x02{}"[..]);
    }

    #[test]
    fn validates_names() {
        assert!(is_valid_name("LOG"));
        assert!(is_valid_name("tailn#ephemeral"));
        assert!(is_valid_name("a.b_c-d"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("#ephemeral"));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name(&"x".repeat(65)));
    }
}
