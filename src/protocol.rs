//! Wire protocol: JSON control messages and the binary UDP media headers.
//!
//! Control channel: newline-delimited JSON objects, discriminated by a
//! `type` field (snake_case). Media headers are fixed-layout big-endian:
//!
//! audio ingress  (16 B): seq u32 | timestamp_ms u64 | uid u32 | opus...
//! video ingress  (36 B): uid u32 | frame_id u32 | chunk_idx u32 |
//!                        total_chunks u32 | seq u32 | timestamp_ms u64 |
//!                        chunk_size u32 | receive_port u32 | payload...
//! video register (12 B): "VGPR" | uid u32 | receive_port u32
//! video egress        : uid u32 | timestamp_ms u64 | jpeg bytes
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Magic prefix of a receiver-only video registration datagram.
pub const REGISTER_MAGIC: [u8; 4] = *b"VGPR";

pub const AUDIO_HEADER_LEN: usize = 16;
pub const VIDEO_HEADER_LEN: usize = 36;
pub const REGISTER_LEN: usize = 12;

/// Messages a client may send on the control channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Login {
        #[serde(default)]
        username: String,
    },
    Heartbeat,
    Chat {
        text: String,
    },
    Broadcast {
        text: String,
    },
    Unicast {
        target_uid: u32,
        text: String,
    },
    GetHistory,
    FileOffer {
        fid: String,
        filename: String,
        size: u64,
    },
    FileRequest {
        fid: String,
    },
    PresentStart {
        #[serde(default = "default_topic")]
        topic: String,
    },
    PresentStop,
    Logout,
}

fn default_topic() -> String {
    "Screen Share".to_string()
}

/// One entry of a `participant_list`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub uid: u32,
    pub username: String,
    pub joined_at: String,
}

/// Messages the server emits on the control channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    LoginSuccess {
        uid: u32,
        username: String,
    },
    ParticipantList {
        participants: Vec<Participant>,
    },
    UserJoined {
        uid: u32,
        username: String,
        timestamp: String,
    },
    UserLeft {
        uid: u32,
        username: String,
        timestamp: String,
    },
    HeartbeatAck {
        timestamp: String,
    },
    Chat {
        uid: u32,
        username: String,
        text: String,
        timestamp: String,
    },
    Broadcast {
        uid: u32,
        username: String,
        text: String,
        timestamp: String,
    },
    Unicast {
        from_uid: u32,
        from_username: String,
        to_uid: u32,
        to_username: String,
        text: String,
        timestamp: String,
    },
    UnicastSent {
        to_uid: u32,
        to_username: String,
        message: String,
    },
    History {
        messages: Vec<ServerMessage>,
        count: usize,
    },
    FileUploadPort {
        fid: String,
        port: u16,
    },
    FileDownloadPort {
        fid: String,
        filename: String,
        size: u64,
        port: u16,
    },
    FileAvailable {
        fid: String,
        filename: String,
        size: u64,
        uploader: String,
        timestamp: String,
    },
    ScreenSharePorts {
        presenter_port: u16,
        viewer_port: u16,
    },
    PresentStart {
        uid: u32,
        username: String,
        topic: String,
        viewer_port: u16,
        timestamp: String,
    },
    PresentStop {
        uid: u32,
        username: String,
        timestamp: String,
    },
    Error {
        message: String,
    },
}

/// Client-visible failures on the control channel: protocol violations and
/// policy rejections. The display text is the wire `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("Malformed JSON")]
    MalformedJson,
    #[error("Message too large")]
    MessageTooLarge,
    #[error("Unknown or invalid message type")]
    UnknownType,
    #[error("Not logged in")]
    NotLoggedIn,
    #[error("Already logged in")]
    AlreadyLoggedIn,
    #[error("User with uid={0} not found")]
    UnknownUser(u32),
    #[error("Invalid file offer: missing fid, filename, or size")]
    InvalidFileOffer,
    #[error("Invalid file request: missing fid")]
    InvalidFileRequest,
    #[error("File not found: fid={0}")]
    FileNotFound(String),
    #[error("Presentation already active")]
    PresentationActive,
    #[error("Failed to start upload server")]
    UploadUnavailable,
    #[error("Failed to start download server")]
    DownloadUnavailable,
    #[error("Failed to start screen sharing")]
    ScreenShareUnavailable,
}

impl ControlError {
    /// The `error` reply carrying this failure.
    pub fn reply(&self) -> ServerMessage {
        ServerMessage::Error { message: self.to_string() }
    }
}

impl ServerMessage {
    /// Serialize as one newline-terminated JSON line.
    pub fn to_line(&self) -> String {
        // The enum is plain data; serialization cannot fail.
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

/// Server wall-clock as an RFC 3339 string (control-channel timestamps).
pub fn now_iso() -> String {
    chrono::Local::now().to_rfc3339()
}

/// Server wall-clock in whole milliseconds (media timestamps).
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Parsed 16-byte audio datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub seq: u32,
    pub timestamp_ms: u64,
    pub uid: u32,
}

impl AudioHeader {
    /// Split a datagram into header and opus payload. Short datagrams are
    /// dropped by returning None.
    pub fn parse(datagram: &[u8]) -> Option<(Self, &[u8])> {
        if datagram.len() < AUDIO_HEADER_LEN {
            return None;
        }
        let seq = u32::from_be_bytes(datagram[0..4].try_into().ok()?);
        let timestamp_ms = u64::from_be_bytes(datagram[4..12].try_into().ok()?);
        let uid = u32::from_be_bytes(datagram[12..16].try_into().ok()?);
        Some((Self { seq, timestamp_ms, uid }, &datagram[AUDIO_HEADER_LEN..]))
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(AUDIO_HEADER_LEN + payload.len());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.uid.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

/// Parsed 36-byte video chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoChunkHeader {
    pub uid: u32,
    pub frame_id: u32,
    pub chunk_idx: u32,
    pub total_chunks: u32,
    pub seq: u32,
    pub timestamp_ms: u64,
    pub chunk_size: u32,
    pub receive_port: u32,
}

impl VideoChunkHeader {
    /// Split a datagram into header and chunk payload.
    pub fn parse(datagram: &[u8]) -> Option<(Self, &[u8])> {
        if datagram.len() < VIDEO_HEADER_LEN {
            return None;
        }
        let h = Self {
            uid: u32::from_be_bytes(datagram[0..4].try_into().ok()?),
            frame_id: u32::from_be_bytes(datagram[4..8].try_into().ok()?),
            chunk_idx: u32::from_be_bytes(datagram[8..12].try_into().ok()?),
            total_chunks: u32::from_be_bytes(datagram[12..16].try_into().ok()?),
            seq: u32::from_be_bytes(datagram[16..20].try_into().ok()?),
            timestamp_ms: u64::from_be_bytes(datagram[20..28].try_into().ok()?),
            chunk_size: u32::from_be_bytes(datagram[28..32].try_into().ok()?),
            receive_port: u32::from_be_bytes(datagram[32..36].try_into().ok()?),
        };
        Some((h, &datagram[VIDEO_HEADER_LEN..]))
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(VIDEO_HEADER_LEN + payload.len());
        out.extend_from_slice(&self.uid.to_be_bytes());
        out.extend_from_slice(&self.frame_id.to_be_bytes());
        out.extend_from_slice(&self.chunk_idx.to_be_bytes());
        out.extend_from_slice(&self.total_chunks.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.chunk_size.to_be_bytes());
        out.extend_from_slice(&self.receive_port.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

/// Decode a `"VGPR" | uid | receive_port` registration datagram.
pub fn parse_registration(datagram: &[u8]) -> Option<(u32, u16)> {
    if datagram.len() != REGISTER_LEN || datagram[0..4] != REGISTER_MAGIC {
        return None;
    }
    let uid = u32::from_be_bytes(datagram[4..8].try_into().ok()?);
    let port = u32::from_be_bytes(datagram[8..12].try_into().ok()?);
    if port == 0 || port > u16::MAX as u32 {
        return None;
    }
    Some((uid, port as u16))
}

/// Build one video egress packet: `uid | timestamp_ms | jpeg`.
pub fn encode_video_broadcast(uid: u32, timestamp_ms: u64, jpeg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + jpeg.len());
    out.extend_from_slice(&uid.to_be_bytes());
    out.extend_from_slice(&timestamp_ms.to_be_bytes());
    out.extend_from_slice(jpeg);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_message_types_dispatch_by_tag() {
        let m: ClientMessage = serde_json::from_str(r#"{"type":"login","username":"alice"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Login { username } if username == "alice"));

        let m: ClientMessage = serde_json::from_str(r#"{"type":"unicast","target_uid":7,"text":"hey"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Unicast { target_uid: 7, .. }));

        // heartbeat may carry a client timestamp; it is ignored
        let m: ClientMessage =
            serde_json::from_str(r#"{"type":"heartbeat","timestamp":"2026-01-01T00:00:00"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Heartbeat));
    }

    #[test]
    fn login_without_username_defaults_empty() {
        let m: ClientMessage = serde_json::from_str(r#"{"type":"login"}"#).unwrap();
        assert!(matches!(m, ClientMessage::Login { username } if username.is_empty()));
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"frobnicate"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"[1,2,3]"#).is_err());
    }

    #[test]
    fn server_message_wire_shape() {
        let line = ServerMessage::LoginSuccess { uid: 1, username: "alice".into() }.to_line();
        let v: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v["type"], "login_success");
        assert_eq!(v["uid"], 1);
        assert_eq!(v["username"], "alice");

        let line = ServerMessage::Error { message: "User with uid=999 not found".into() }.to_line();
        assert!(line.ends_with('\n'));
        let v: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["message"], "User with uid=999 not found");
    }

    #[test]
    fn history_nests_messages_with_count() {
        let msg = ServerMessage::History {
            messages: vec![ServerMessage::Chat {
                uid: 1,
                username: "alice".into(),
                text: "hi".into(),
                timestamp: "t".into(),
            }],
            count: 1,
        };
        let v: serde_json::Value = serde_json::from_str(msg.to_line().trim_end()).unwrap();
        assert_eq!(v["count"], 1);
        assert_eq!(v["messages"][0]["type"], "chat");
        assert_eq!(v["messages"][0]["text"], "hi");
    }

    #[test]
    fn audio_header_round_trip() {
        let h = AudioHeader { seq: 42, timestamp_ms: 1_700_000_000_123, uid: 9 };
        let wire = h.encode(b"opus-bytes");
        assert_eq!(wire.len(), AUDIO_HEADER_LEN + 10);
        let (parsed, payload) = AudioHeader::parse(&wire).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(payload, b"opus-bytes");
    }

    #[test]
    fn audio_header_rejects_short_datagram() {
        assert!(AudioHeader::parse(&[0u8; AUDIO_HEADER_LEN - 1]).is_none());
    }

    #[test]
    fn video_header_round_trip() {
        let h = VideoChunkHeader {
            uid: 3,
            frame_id: 17,
            chunk_idx: 2,
            total_chunks: 5,
            seq: 88,
            timestamp_ms: 555,
            chunk_size: 4,
            receive_port: 12345,
        };
        let wire = h.encode(b"jpeg");
        assert_eq!(wire.len(), VIDEO_HEADER_LEN + 4);
        let (parsed, payload) = VideoChunkHeader::parse(&wire).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(payload, b"jpeg");
    }

    #[test]
    fn registration_datagram_shape() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&REGISTER_MAGIC);
        wire.extend_from_slice(&7u32.to_be_bytes());
        wire.extend_from_slice(&10500u32.to_be_bytes());
        assert_eq!(parse_registration(&wire), Some((7, 10500)));

        // wrong magic
        let mut bad = wire.clone();
        bad[0] = b'X';
        assert_eq!(parse_registration(&bad), None);
        // trailing bytes make it a chunk, not a registration
        wire.push(0);
        assert_eq!(parse_registration(&wire), None);
        // port outside u16
        let mut big = Vec::new();
        big.extend_from_slice(&REGISTER_MAGIC);
        big.extend_from_slice(&7u32.to_be_bytes());
        big.extend_from_slice(&70000u32.to_be_bytes());
        assert_eq!(parse_registration(&big), None);
    }

    #[test]
    fn video_broadcast_packet_layout() {
        let pkt = encode_video_broadcast(5, 999, b"JJ");
        assert_eq!(&pkt[0..4], &5u32.to_be_bytes());
        assert_eq!(&pkt[4..12], &999u64.to_be_bytes());
        assert_eq!(&pkt[12..], b"JJ");
    }
}
