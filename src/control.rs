//! Control plane: one long-lived TCP connection per user carrying
//! newline-delimited JSON, dispatched to the registry, chat log, transfer
//! broker, and screen-share relay.
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::audio::AudioMixer;
use crate::chat::ChatLog;
use crate::config::ServerConfig;
use crate::files::TransferBroker;
use crate::protocol::{now_iso, ClientMessage, ControlError, ServerMessage};
use crate::registry::Registry;
use crate::screen::ScreenShare;
use crate::video::VideoRelay;

/// Wires every inbound message to its owning component. The media plane is
/// optional: chat/files/screen keep working when audio or video failed to
/// start.
pub struct ControlPlane {
    registry: Arc<Registry>,
    chat: Arc<ChatLog>,
    files: Arc<TransferBroker>,
    screen: Arc<ScreenShare>,
    audio: Option<Arc<AudioMixer>>,
    video: Option<Arc<VideoRelay>>,
    max_line: usize,
}

enum LineRead {
    Line,
    TooLong,
    Eof,
}

impl ControlPlane {
    pub fn new(
        cfg: &ServerConfig,
        registry: Arc<Registry>,
        chat: Arc<ChatLog>,
        files: Arc<TransferBroker>,
        screen: Arc<ScreenShare>,
        audio: Option<Arc<AudioMixer>>,
        video: Option<Arc<VideoRelay>>,
    ) -> Self {
        Self { registry, chat, files, screen, audio, video, max_line: cfg.max_line_bytes }
    }

    /// Accept loop; one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("[CONTROL] connection from {peer}");
                    let plane = Arc::clone(&self);
                    tokio::spawn(async move {
                        plane.handle_connection(stream).await;
                    });
                }
                Err(e) => {
                    warn!("[CONTROL] accept error: {e}");
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = unbounded_channel::<String>();
        tokio::spawn(writer_loop(write_half, rx));

        let mut reader = BufReader::new(read_half);
        let mut line = Vec::new();
        let mut uid: Option<u32> = None;

        loop {
            match read_line_bounded(&mut reader, &mut line, self.max_line).await {
                Ok(LineRead::Eof) => break,
                Ok(LineRead::TooLong) => {
                    send_line(&tx, &ControlError::MessageTooLarge.reply());
                    continue;
                }
                Ok(LineRead::Line) => {}
                Err(e) => {
                    debug!("[CONTROL] read error: {e}");
                    break;
                }
            }
            let raw = line.as_slice();
            if raw.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            // malformed input gets an error reply, never a hangup
            let value: serde_json::Value = match serde_json::from_slice(raw) {
                Ok(v @ serde_json::Value::Object(_)) => v,
                _ => {
                    send_line(&tx, &ControlError::MalformedJson.reply());
                    continue;
                }
            };
            let msg: ClientMessage = match serde_json::from_value(value) {
                Ok(m) => m,
                Err(e) => {
                    debug!("[CONTROL] unparseable message: {e}");
                    send_line(&tx, &ControlError::UnknownType.reply());
                    continue;
                }
            };

            match (uid, msg) {
                (None, ClientMessage::Login { username }) => {
                    let p = self.registry.register(&username, tx.clone());
                    uid = Some(p.uid);
                    info!("[CONTROL] login: {} (uid={})", p.username, p.uid);
                    self.registry.send_to(
                        p.uid,
                        &ServerMessage::LoginSuccess { uid: p.uid, username: p.username.clone() },
                    );
                    self.registry.broadcast(
                        &ServerMessage::UserJoined {
                            uid: p.uid,
                            username: p.username,
                            timestamp: now_iso(),
                        },
                        Some(p.uid),
                    );
                    self.broadcast_participants();
                }
                (Some(_), ClientMessage::Login { .. }) => {
                    send_line(&tx, &ControlError::AlreadyLoggedIn.reply());
                }
                (None, _) => {
                    send_line(&tx, &ControlError::NotLoggedIn.reply());
                }
                (Some(uid), ClientMessage::Heartbeat) => {
                    debug!("[CONTROL] heartbeat from uid={uid}");
                    self.registry.send_to(uid, &ServerMessage::HeartbeatAck { timestamp: now_iso() });
                    self.registry.send_to(
                        uid,
                        &ServerMessage::ParticipantList { participants: self.registry.snapshot() },
                    );
                }
                (Some(uid), ClientMessage::Chat { text }) => {
                    let username = self.username(uid);
                    let record = ServerMessage::Chat { uid, username, text, timestamp: now_iso() };
                    self.chat.push(record.clone());
                    self.registry.broadcast(&record, None);
                }
                (Some(uid), ClientMessage::Broadcast { text }) => {
                    let username = self.username(uid);
                    let record = ServerMessage::Broadcast { uid, username, text, timestamp: now_iso() };
                    self.chat.push(record.clone());
                    self.registry.broadcast(&record, None);
                }
                (Some(uid), ClientMessage::Unicast { target_uid, text }) => {
                    let Some(to_username) = self.registry.resolve(target_uid) else {
                        self.registry.send_to(uid, &ControlError::UnknownUser(target_uid).reply());
                        continue;
                    };
                    let record = ServerMessage::Unicast {
                        from_uid: uid,
                        from_username: self.username(uid),
                        to_uid: target_uid,
                        to_username: to_username.clone(),
                        text,
                        timestamp: now_iso(),
                    };
                    self.chat.push(record.clone());
                    self.registry.send_to(target_uid, &record);
                    self.registry.send_to(
                        uid,
                        &ServerMessage::UnicastSent {
                            to_uid: target_uid,
                            to_username,
                            message: "Message sent successfully".into(),
                        },
                    );
                }
                (Some(uid), ClientMessage::GetHistory) => {
                    info!("[CONTROL] history requested by uid={uid}");
                    let messages = self.chat.replay();
                    let count = messages.len();
                    self.registry.send_to(uid, &ServerMessage::History { messages, count });
                }
                (Some(uid), ClientMessage::FileOffer { fid, filename, size }) => {
                    self.files.handle_offer(uid, fid, filename, size).await;
                }
                (Some(uid), ClientMessage::FileRequest { fid }) => {
                    self.files.handle_request(uid, fid).await;
                }
                (Some(uid), ClientMessage::PresentStart { topic }) => {
                    self.screen.handle_present_start(uid, topic).await;
                }
                (Some(uid), ClientMessage::PresentStop) => {
                    self.screen.handle_present_stop(uid);
                }
                (Some(uid), ClientMessage::Logout) => {
                    info!("[CONTROL] logout from uid={uid}");
                    break;
                }
            }
        }

        if let Some(uid) = uid {
            self.disconnect(uid);
        }
    }

    fn username(&self, uid: u32) -> String {
        self.registry.resolve(uid).unwrap_or_else(|| format!("user_{uid}"))
    }

    fn broadcast_participants(&self) {
        self.registry
            .broadcast(&ServerMessage::ParticipantList { participants: self.registry.snapshot() }, None);
    }

    /// Remove the user and cascade: pending transfers aborted, presentation
    /// stopped, media records released, then the leave announced to the
    /// remaining users.
    pub fn disconnect(&self, uid: u32) {
        let Some(entry) = self.registry.unregister(uid) else { return };
        info!("[CONTROL] disconnect: {} (uid={uid})", entry.username);
        self.files.handle_user_left(uid);
        self.screen.handle_user_left(uid);
        if let Some(audio) = &self.audio {
            audio.handle_user_left(uid);
        }
        if let Some(video) = &self.video {
            video.handle_user_left(uid);
        }
        self.registry.broadcast(
            &ServerMessage::UserLeft { uid, username: entry.username, timestamp: now_iso() },
            None,
        );
        self.broadcast_participants();
    }
}

fn send_line(tx: &UnboundedSender<String>, msg: &ServerMessage) {
    let _ = tx.send(msg.to_line());
}

/// Per-connection writer: drains the queue so outbound JSON objects never
/// interleave. Exits on write failure or when every sender is gone.
async fn writer_loop(mut socket: OwnedWriteHalf, mut rx: UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = socket.write_all(line.as_bytes()).await {
            debug!("[CONTROL] write failed: {e}");
            break;
        }
    }
    socket.shutdown().await.ok();
}

/// Read one newline-terminated line, enforcing the byte cap. An oversized
/// line is consumed to its end and reported as TooLong so the connection
/// stays usable.
async fn read_line_bounded(
    reader: &mut BufReader<OwnedReadHalf>,
    line: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<LineRead> {
    line.clear();
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(LineRead::Eof);
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            if !overflow {
                line.extend_from_slice(&available[..pos]);
            }
            reader.consume(pos + 1);
            return Ok(if overflow || line.len() > max { LineRead::TooLong } else { LineRead::Line });
        }
        if !overflow {
            if line.len() + available.len() > max {
                overflow = true;
                line.clear();
            } else {
                line.extend_from_slice(available);
            }
        }
        let n = available.len();
        reader.consume(n);
    }
}
