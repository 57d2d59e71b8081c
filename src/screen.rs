//! Screen-share relay: per-presenter port pair with length-prefixed frames.
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::net;
use crate::protocol::{now_iso, ControlError, ServerMessage};
use crate::registry::Registry;

/// One frame as written to viewers: `len(u32 be) || jpeg`, shared across
/// all viewer queues without copying.
type Frame = Arc<Vec<u8>>;

struct Viewer {
    id: u64,
    tx: mpsc::Sender<Frame>,
}

struct Presentation {
    username: String,
    topic: String,
    presenter_port: u16,
    viewer_port: u16,
    viewers: Arc<Mutex<Vec<Viewer>>>,
    stopping: Arc<AtomicBool>,
    tasks: Vec<AbortHandle>,
}

/// Per-uid presentation lifecycle and the frame relay itself. Different
/// uids may present concurrently; each presentation owns its own pair of
/// one-shot ports.
pub struct ScreenShare {
    registry: Arc<Registry>,
    host: IpAddr,
    deadline: Duration,
    max_frame: u32,
    viewer_queue: usize,
    next_viewer_id: AtomicU64,
    presentations: Mutex<HashMap<u32, Presentation>>,
}

impl ScreenShare {
    pub fn new(cfg: &ServerConfig, registry: Arc<Registry>) -> Self {
        Self {
            registry,
            host: cfg.host,
            deadline: cfg.share_deadline,
            max_frame: cfg.max_share_frame,
            viewer_queue: 16,
            next_viewer_id: AtomicU64::new(1),
            presentations: Mutex::new(HashMap::new()),
        }
    }

    /// `present_start`: allocate the port pair, announce it, and wait for
    /// the presenter in the background.
    pub async fn handle_present_start(self: &Arc<Self>, uid: u32, topic: String) {
        if self.presentations.lock().contains_key(&uid) {
            self.registry.send_to(uid, &ControlError::PresentationActive.reply());
            return;
        }
        let username = self.registry.resolve(uid).unwrap_or_else(|| format!("user_{uid}"));

        let (presenter_listener, presenter_port) = match net::bind_ephemeral(self.host).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[SCREEN] presenter port bind failed: {e:#}");
                self.registry.send_to(uid, &ControlError::ScreenShareUnavailable.reply());
                return;
            }
        };
        let (viewer_listener, viewer_port) = match net::bind_ephemeral(self.host).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[SCREEN] viewer port bind failed: {e:#}");
                self.registry.send_to(uid, &ControlError::ScreenShareUnavailable.reply());
                return;
            }
        };

        let viewers: Arc<Mutex<Vec<Viewer>>> = Arc::new(Mutex::new(Vec::new()));
        let stopping = Arc::new(AtomicBool::new(false));

        info!("[SCREEN] {username} (uid={uid}) presenting '{topic}': presenter port {presenter_port}, viewer port {viewer_port}");

        // register the presentation before any task can race to stop it
        self.presentations.lock().insert(
            uid,
            Presentation {
                username: username.clone(),
                topic: topic.clone(),
                presenter_port,
                viewer_port,
                viewers: Arc::clone(&viewers),
                stopping: Arc::clone(&stopping),
                tasks: Vec::new(),
            },
        );

        // Viewer accepts run until the presentation stops; each viewer gets
        // its own writer task so relay never awaits a socket under a lock.
        let share = Arc::clone(self);
        let viewer_set = Arc::clone(&viewers);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = viewer_listener.accept().await else { break };
                info!("[SCREEN] viewer connected from {peer}");
                let (_, write_half) = stream.into_split();
                let id = share.next_viewer_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = mpsc::channel::<Frame>(share.viewer_queue);
                viewer_set.lock().push(Viewer { id, tx });
                tokio::spawn(viewer_writer(id, write_half, rx, Arc::clone(&viewer_set)));
            }
        });

        let share = Arc::clone(self);
        let relay_viewers = Arc::clone(&viewers);
        let relay_stopping = Arc::clone(&stopping);
        let presenter_task = tokio::spawn(async move {
            match timeout(share.deadline, presenter_listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    info!("[SCREEN] presenter connected from {peer}");
                    drop(presenter_listener);
                    let (read_half, _write_half) = stream.into_split();
                    share.relay_frames(read_half, relay_viewers, relay_stopping).await;
                }
                Ok(Err(e)) => warn!("[SCREEN] presenter accept failed: {e}"),
                Err(_) => warn!("[SCREEN] presenter for uid={uid} never connected; tearing down"),
            }
            share.stop(uid);
        });

        let handles = vec![accept_task.abort_handle(), presenter_task.abort_handle()];
        match self.presentations.lock().get_mut(&uid) {
            Some(pres) => pres.tasks = handles,
            // already stopped in the window above; tear the tasks down too
            None => {
                for h in &handles {
                    h.abort();
                }
            }
        }

        self.registry
            .send_to(uid, &ServerMessage::ScreenSharePorts { presenter_port, viewer_port });
        self.registry.broadcast(
            &ServerMessage::PresentStart { uid, username, topic, viewer_port, timestamp: now_iso() },
            None,
        );
    }

    /// Pump `len || body` frames from the presenter to every viewer until
    /// EOF, a read error, or a cooperative stop.
    async fn relay_frames(
        &self,
        mut presenter: OwnedReadHalf,
        viewers: Arc<Mutex<Vec<Viewer>>>,
        stopping: Arc<AtomicBool>,
    ) {
        let mut len_buf = [0u8; 4];
        loop {
            if stopping.load(Ordering::Relaxed) {
                break;
            }
            if presenter.read_exact(&mut len_buf).await.is_err() {
                info!("[SCREEN] presenter disconnected");
                break;
            }
            let frame_len = u32::from_be_bytes(len_buf);
            if frame_len > self.max_frame {
                warn!("[SCREEN] presenter declared {frame_len}-byte frame; dropping relay");
                break;
            }
            let mut frame = Vec::with_capacity(4 + frame_len as usize);
            frame.extend_from_slice(&len_buf);
            frame.resize(4 + frame_len as usize, 0);
            if presenter.read_exact(&mut frame[4..]).await.is_err() {
                info!("[SCREEN] presenter disconnected mid-frame");
                break;
            }
            let frame: Frame = Arc::new(frame);

            // snapshot the queue handles, then send outside the lock
            let targets: Vec<(u64, mpsc::Sender<Frame>)> =
                viewers.lock().iter().map(|v| (v.id, v.tx.clone())).collect();
            let mut dead = Vec::new();
            for (id, tx) in targets {
                // a closed queue means the viewer's socket already failed;
                // a full one means it is too slow for this frame
                if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(Arc::clone(&frame)) {
                    dead.push(id);
                }
            }
            if !dead.is_empty() {
                viewers.lock().retain(|v| !dead.contains(&v.id));
            }
        }
    }

    /// `present_stop` from the control channel.
    pub fn handle_present_stop(self: &Arc<Self>, uid: u32) {
        if !self.presentations.lock().contains_key(&uid) {
            warn!("[SCREEN] present_stop from uid={uid} with no active presentation");
            return;
        }
        self.stop(uid);
    }

    /// Tear a presentation down: close viewers, free both ports, broadcast
    /// `present_stop`. Safe to call from any of the stop paths; only the
    /// first caller does the work.
    pub fn stop(self: &Arc<Self>, uid: u32) {
        let Some(pres) = self.presentations.lock().remove(&uid) else { return };
        pres.stopping.store(true, Ordering::Relaxed);
        for task in &pres.tasks {
            task.abort();
        }
        // dropping the queue senders closes every viewer writer task, which
        // shuts its socket down and yields EOF on the viewer side
        pres.viewers.lock().clear();
        info!(
            "[SCREEN] presentation by {} (uid={uid}, '{}') stopped; ports {}/{} released",
            pres.username, pres.topic, pres.presenter_port, pres.viewer_port
        );
        self.registry.broadcast(
            &ServerMessage::PresentStop { uid, username: pres.username, timestamp: now_iso() },
            None,
        );
    }

    /// Leave cascade from the control plane.
    pub fn handle_user_left(self: &Arc<Self>, uid: u32) {
        self.stop(uid);
    }

    /// Stop every active presentation (shutdown path).
    pub fn shutdown(self: &Arc<Self>) {
        let uids: Vec<u32> = self.presentations.lock().keys().copied().collect();
        for uid in uids {
            self.stop(uid);
        }
    }

    pub fn is_presenting(&self, uid: u32) -> bool {
        self.presentations.lock().contains_key(&uid)
    }
}

/// Drain one viewer's frame queue onto its socket. Ends (and removes the
/// viewer from the set) on write failure or when the presentation drops the
/// queue sender.
async fn viewer_writer(
    id: u64,
    mut socket: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    viewers: Arc<Mutex<Vec<Viewer>>>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = socket.write_all(&frame).await {
            warn!("[SCREEN] viewer write failed: {e}; dropping viewer");
            break;
        }
    }
    viewers.lock().retain(|v| v.id != id);
    socket.shutdown().await.ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    async fn setup() -> (Arc<ScreenShare>, Arc<Registry>, u32, UnboundedReceiver<String>) {
        let mut cfg = ServerConfig::default();
        cfg.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let registry = Arc::new(Registry::new());
        let (tx, rx) = unbounded_channel();
        let p = registry.register("alice", tx);
        let share = Arc::new(ScreenShare::new(&cfg, Arc::clone(&registry)));
        (share, registry, p.uid, rx)
    }

    fn ports_from(line: &str) -> (u16, u16) {
        let v: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(v["type"], "screen_share_ports");
        (v["presenter_port"].as_u64().unwrap() as u16, v["viewer_port"].as_u64().unwrap() as u16)
    }

    #[tokio::test]
    async fn frame_reaches_every_viewer_and_stop_yields_eof() {
        let (share, _registry, uid, mut rx) = setup().await;
        share.handle_present_start(uid, "demo".into()).await;
        let (pp, pv) = ports_from(&rx.recv().await.unwrap());
        let start = rx.recv().await.unwrap();
        assert!(start.contains("present_start"));

        let mut bob = TcpStream::connect(("127.0.0.1", pv)).await.unwrap();
        let mut carol = TcpStream::connect(("127.0.0.1", pv)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut presenter = TcpStream::connect(("127.0.0.1", pp)).await.unwrap();
        let body = b"HELLOHELLOHELLOHI";
        presenter.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        presenter.write_all(body).await.unwrap();

        for viewer in [&mut bob, &mut carol] {
            let mut len = [0u8; 4];
            viewer.read_exact(&mut len).await.unwrap();
            assert_eq!(u32::from_be_bytes(len), 17);
            let mut got = vec![0u8; 17];
            viewer.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, body);
        }

        share.handle_present_stop(uid);
        let stop = rx.recv().await.unwrap();
        assert!(stop.contains("present_stop"));
        // EOF on both viewers after teardown
        let mut scratch = [0u8; 1];
        assert_eq!(bob.read(&mut scratch).await.unwrap(), 0);
        assert_eq!(carol.read(&mut scratch).await.unwrap(), 0);
        assert!(!share.is_presenting(uid));
    }

    #[tokio::test]
    async fn duplicate_present_start_is_rejected() {
        let (share, _registry, uid, mut rx) = setup().await;
        share.handle_present_start(uid, "one".into()).await;
        rx.recv().await.unwrap(); // ports
        rx.recv().await.unwrap(); // broadcast
        share.handle_present_start(uid, "two".into()).await;
        let reply = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(reply.trim_end()).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["message"], "Presentation already active");
    }

    #[tokio::test]
    async fn presentations_by_different_uids_are_isolated() {
        let (share, registry, alice, mut rx_a) = setup().await;
        let (tx_b, mut rx_b) = unbounded_channel();
        let bob = registry.register("bob", tx_b).uid;

        share.handle_present_start(alice, "a".into()).await;
        let (pa, va) = ports_from(&rx_a.recv().await.unwrap());
        share.handle_present_start(bob, "b".into()).await;
        // drain bob's queue until his ports message shows up
        let ports_line = loop {
            let line = rx_b.recv().await.unwrap();
            if line.contains("screen_share_ports") {
                break line;
            }
        };
        let (pb, _vb) = ports_from(&ports_line);
        assert_ne!(pa, pb);

        // viewer on alice's port sees alice's frame only
        let mut viewer = TcpStream::connect(("127.0.0.1", va)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut pres_b = TcpStream::connect(("127.0.0.1", pb)).await.unwrap();
        pres_b.write_all(&4u32.to_be_bytes()).await.unwrap();
        pres_b.write_all(b"BBBB").await.unwrap();

        let mut pres_a = TcpStream::connect(("127.0.0.1", pa)).await.unwrap();
        pres_a.write_all(&4u32.to_be_bytes()).await.unwrap();
        pres_a.write_all(b"AAAA").await.unwrap();

        let mut len = [0u8; 4];
        viewer.read_exact(&mut len).await.unwrap();
        let mut got = vec![0u8; 4];
        viewer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"AAAA");
    }

    #[tokio::test]
    async fn presenter_eof_broadcasts_stop() {
        let (share, _registry, uid, mut rx) = setup().await;
        share.handle_present_start(uid, "demo".into()).await;
        let (pp, _pv) = ports_from(&rx.recv().await.unwrap());
        rx.recv().await.unwrap(); // present_start broadcast

        let presenter = TcpStream::connect(("127.0.0.1", pp)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(presenter);

        let stop = rx.recv().await.unwrap();
        let v: serde_json::Value = serde_json::from_str(stop.trim_end()).unwrap();
        assert_eq!(v["type"], "present_stop");
        assert_eq!(v["uid"], uid);
    }
}
