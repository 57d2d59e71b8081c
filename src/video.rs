//! UDP video plane: chunk reassembly on the ingress port, assembled-frame
//! fan-out from a dedicated broadcast socket.
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::config::ServerConfig;
use crate::protocol::{self, VideoChunkHeader};

const BROADCAST_QUEUE: usize = 64;

/// A video participant: identified by uid, replied to at its last source IP
/// and separately advertised receive port. A registration datagram alone is
/// enough to become a broadcast target.
struct VideoClient {
    addr: SocketAddr,
    receive_port: u16,
    last_packet: Instant,
    frames_assembled: u64,
    bytes_assembled: u64,
}

/// One complete reassembled frame ready for fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFrame {
    pub uid: u32,
    pub frame_id: u32,
    pub timestamp_ms: u64,
    pub data: Vec<u8>,
}

/// In-flight slot for one (uid, frame_id): chunk payloads indexed by
/// chunk_idx, so completion needs no sort.
struct Slot {
    chunks: Vec<Option<Vec<u8>>>,
    total: u32,
    chunk_size: u32,
    remaining: u32,
    created: Instant,
    timestamp_ms: u64,
}

/// Why a chunk was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reject {
    TooManyFrames,
    FrameTooLarge,
    TotalMismatch,
    SizeMismatch,
    Duplicate,
}

enum Insert {
    Stored,
    Completed(AssembledFrame),
    Rejected(Reject),
}

/// Reassembly state for all senders. Kept lock-free internally; the caller
/// wraps it in the single component mutex and does the heavy work (concat
/// already done here is O(frame) once per frame) outside any socket I/O.
struct ReassemblyBuffer {
    per_uid: HashMap<u32, HashMap<u32, Slot>>,
    max_frames_per_client: usize,
    max_frame_size: u64,
}

impl ReassemblyBuffer {
    fn new(max_frames_per_client: usize, max_frame_size: u64) -> Self {
        Self { per_uid: HashMap::new(), max_frames_per_client, max_frame_size }
    }

    fn insert(&mut self, header: &VideoChunkHeader, payload: &[u8]) -> Insert {
        use std::collections::hash_map::Entry;

        let frames = self.per_uid.entry(header.uid).or_default();
        let in_flight = frames.len();
        let slot = match frames.entry(header.frame_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(v) => {
                if in_flight >= self.max_frames_per_client {
                    return Insert::Rejected(Reject::TooManyFrames);
                }
                if header.total_chunks as u64 * header.chunk_size as u64 > self.max_frame_size {
                    return Insert::Rejected(Reject::FrameTooLarge);
                }
                v.insert(Slot {
                    chunks: vec![None; header.total_chunks as usize],
                    total: header.total_chunks,
                    chunk_size: header.chunk_size,
                    remaining: header.total_chunks,
                    created: Instant::now(),
                    timestamp_ms: header.timestamp_ms,
                })
            }
        };

        // later chunks must agree with what the first sighting pinned
        if header.total_chunks != slot.total {
            return Insert::Rejected(Reject::TotalMismatch);
        }
        if header.chunk_size != slot.chunk_size {
            return Insert::Rejected(Reject::SizeMismatch);
        }
        let idx = header.chunk_idx as usize;
        if slot.chunks[idx].is_some() {
            return Insert::Rejected(Reject::Duplicate);
        }
        slot.chunks[idx] = Some(payload.to_vec());
        slot.remaining -= 1;
        if slot.remaining > 0 {
            return Insert::Stored;
        }

        let chunks = std::mem::take(&mut slot.chunks);
        let capacity = slot.total as usize * slot.chunk_size as usize;
        let timestamp_ms = slot.timestamp_ms;
        frames.remove(&header.frame_id);
        let mut data = Vec::with_capacity(capacity);
        for chunk in chunks.into_iter().flatten() {
            data.extend_from_slice(&chunk);
        }
        Insert::Completed(AssembledFrame {
            uid: header.uid,
            frame_id: header.frame_id,
            timestamp_ms,
            data,
        })
    }

    /// Discard slots older than `timeout`; returns (uid, frame_id,
    /// received, total) per discarded slot for logging.
    fn sweep(&mut self, timeout: Duration) -> Vec<(u32, u32, u32, u32)> {
        let mut discarded = Vec::new();
        for (uid, frames) in self.per_uid.iter_mut() {
            frames.retain(|frame_id, slot| {
                if slot.created.elapsed() > timeout {
                    discarded.push((*uid, *frame_id, slot.total - slot.remaining, slot.total));
                    false
                } else {
                    true
                }
            });
        }
        self.per_uid.retain(|_, frames| !frames.is_empty());
        discarded
    }

    fn drop_uid(&mut self, uid: u32) {
        self.per_uid.remove(&uid);
    }

    fn in_flight(&self, uid: u32) -> usize {
        self.per_uid.get(&uid).map_or(0, |f| f.len())
    }
}

/// The video plane: ingress task, broadcast task, 1 Hz sweep task.
pub struct VideoRelay {
    clients: Arc<Mutex<HashMap<u32, VideoClient>>>,
    buffer: Arc<Mutex<ReassemblyBuffer>>,
    invalid_drops: Arc<AtomicU64>,
    tasks: Vec<AbortHandle>,
    pub ingress_addr: SocketAddr,
}

impl VideoRelay {
    /// Bind both sockets and spawn the three tasks.
    pub async fn start(cfg: &ServerConfig) -> Result<Self> {
        let ingress = UdpSocket::bind((cfg.host, cfg.video_port))
            .await
            .with_context(|| format!("bind video ingress udp {}:{}", cfg.host, cfg.video_port))?;
        let ingress_addr = ingress.local_addr().context("video ingress local_addr")?;
        // sending from a fixed source port lets simple LAN clients listen
        // for the server without learning it first
        let broadcast = UdpSocket::bind((cfg.host, cfg.video_broadcast_port))
            .await
            .with_context(|| format!("bind video broadcast udp {}:{}", cfg.host, cfg.video_broadcast_port))?;
        info!(
            "[VIDEO] receiving chunks on {ingress_addr}, broadcasting from port {}",
            broadcast.local_addr().map(|a| a.port()).unwrap_or(0)
        );

        let clients: Arc<Mutex<HashMap<u32, VideoClient>>> = Arc::new(Mutex::new(HashMap::new()));
        let buffer = Arc::new(Mutex::new(ReassemblyBuffer::new(
            cfg.max_frames_per_client,
            cfg.max_frame_size,
        )));
        let invalid_drops = Arc::new(AtomicU64::new(0));
        let (frame_tx, frame_rx) = mpsc::channel::<AssembledFrame>(BROADCAST_QUEUE);

        let mut tasks = Vec::new();
        {
            let clients = clients.clone();
            let buffer = buffer.clone();
            let invalid_drops = invalid_drops.clone();
            let max_chunks = cfg.max_chunks;
            let max_chunk_size = cfg.max_chunk_size;
            let task = tokio::spawn(async move {
                ingress_loop(ingress, clients, buffer, frame_tx, invalid_drops, max_chunks, max_chunk_size).await;
            });
            tasks.push(task.abort_handle());
        }
        {
            let clients = clients.clone();
            let task = tokio::spawn(broadcast_loop(broadcast, clients, frame_rx));
            tasks.push(task.abort_handle());
        }
        {
            let clients = clients.clone();
            let buffer = buffer.clone();
            let chunk_timeout = cfg.chunk_timeout;
            let client_timeout = cfg.client_timeout;
            let evict_period = cfg.evict_period;
            let task = tokio::spawn(sweep_loop(clients, buffer, chunk_timeout, client_timeout, evict_period));
            tasks.push(task.abort_handle());
        }

        Ok(Self { clients, buffer, invalid_drops, tasks, ingress_addr })
    }

    pub fn stop(&self) {
        for t in &self.tasks {
            t.abort();
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn invalid_drops(&self) -> u64 {
        self.invalid_drops.load(Ordering::Relaxed)
    }

    /// Leave cascade: forget the user's record and any in-flight frames.
    pub fn handle_user_left(&self, uid: u32) {
        self.clients.lock().remove(&uid);
        self.buffer.lock().drop_uid(uid);
    }
}

fn touch_client(
    clients: &Mutex<HashMap<u32, VideoClient>>,
    uid: u32,
    addr: SocketAddr,
    receive_port: u16,
) {
    let mut table = clients.lock();
    match table.get_mut(&uid) {
        Some(c) => {
            c.addr = addr;
            c.receive_port = receive_port;
            c.last_packet = Instant::now();
        }
        None => {
            info!("[VIDEO] new client: uid={uid} from {addr}, receiving on port {receive_port}");
            table.insert(
                uid,
                VideoClient {
                    addr,
                    receive_port,
                    last_packet: Instant::now(),
                    frames_assembled: 0,
                    bytes_assembled: 0,
                },
            );
        }
    }
}

async fn ingress_loop(
    socket: UdpSocket,
    clients: Arc<Mutex<HashMap<u32, VideoClient>>>,
    buffer: Arc<Mutex<ReassemblyBuffer>>,
    frame_tx: mpsc::Sender<AssembledFrame>,
    invalid_drops: Arc<AtomicU64>,
    max_chunks: u32,
    max_chunk_size: u32,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[VIDEO] recv error: {e}");
                continue;
            }
        };
        let datagram = &buf[..n];

        // receiver-only registration keeps a client Active without chunks
        if let Some((uid, port)) = protocol::parse_registration(datagram) {
            touch_client(&clients, uid, src, port);
            continue;
        }

        let Some((header, payload)) = VideoChunkHeader::parse(datagram) else {
            invalid_drops.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        if payload.len() != header.chunk_size as usize
            || header.total_chunks == 0
            || header.total_chunks > max_chunks
            || header.chunk_idx >= header.total_chunks
            || header.chunk_size == 0
            || header.chunk_size > max_chunk_size
            || header.receive_port == 0
            || header.receive_port > u16::MAX as u32
        {
            invalid_drops.fetch_add(1, Ordering::Relaxed);
            debug!("[VIDEO] invalid chunk header from {src} (uid={})", header.uid);
            continue;
        }

        touch_client(&clients, header.uid, src, header.receive_port as u16);

        let outcome = buffer.lock().insert(&header, payload);
        match outcome {
            Insert::Stored => {}
            Insert::Rejected(reason) => {
                invalid_drops.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "[VIDEO] chunk {}/{} of frame {} from uid={} rejected: {reason:?}",
                    header.chunk_idx, header.total_chunks, header.frame_id, header.uid
                );
            }
            Insert::Completed(frame) => {
                debug!(
                    "[VIDEO] frame {} from uid={} complete ({} bytes)",
                    frame.frame_id,
                    frame.uid,
                    frame.data.len()
                );
                {
                    let mut table = clients.lock();
                    if let Some(c) = table.get_mut(&frame.uid) {
                        c.frames_assembled += 1;
                        c.bytes_assembled += frame.data.len() as u64;
                    }
                }
                // a full queue means fan-out is saturated; dropping here
                // keeps ingress live (real-time media never backpressures)
                if frame_tx.try_send(frame).is_err() {
                    invalid_drops.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Drain assembled frames and send each to every registered client except
/// its sender. Send errors are logged only; the registration loop refreshes
/// dead entries soon enough.
async fn broadcast_loop(
    socket: UdpSocket,
    clients: Arc<Mutex<HashMap<u32, VideoClient>>>,
    mut frame_rx: mpsc::Receiver<AssembledFrame>,
) {
    while let Some(frame) = frame_rx.recv().await {
        let packet = protocol::encode_video_broadcast(frame.uid, frame.timestamp_ms, &frame.data);
        let targets: Vec<(u32, SocketAddr)> = clients
            .lock()
            .iter()
            .filter(|(uid, _)| **uid != frame.uid)
            .map(|(uid, c)| (*uid, SocketAddr::new(c.addr.ip(), c.receive_port)))
            .collect();
        for (uid, addr) in targets {
            if let Err(e) = socket.send_to(&packet, addr).await {
                debug!("[VIDEO] broadcast to uid={uid} at {addr} failed: {e}");
            }
        }
    }
}

/// 1 Hz housekeeping: expire stale reassembly slots every pass, quiet
/// clients on the eviction cadence.
async fn sweep_loop(
    clients: Arc<Mutex<HashMap<u32, VideoClient>>>,
    buffer: Arc<Mutex<ReassemblyBuffer>>,
    chunk_timeout: Duration,
    client_timeout: Duration,
    evict_period: Duration,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut since_evict = Duration::ZERO;
    loop {
        interval.tick().await;
        for (uid, frame_id, received, total) in buffer.lock().sweep(chunk_timeout) {
            warn!("[VIDEO] discarded stale frame {frame_id} from uid={uid} ({received}/{total} chunks)");
        }
        since_evict += Duration::from_secs(1);
        if since_evict >= evict_period {
            since_evict = Duration::ZERO;
            let mut stale = Vec::new();
            clients.lock().retain(|uid, c| {
                if c.last_packet.elapsed() > client_timeout {
                    stale.push((*uid, c.frames_assembled, c.bytes_assembled));
                    false
                } else {
                    true
                }
            });
            for (uid, frames, bytes) in stale {
                info!("[VIDEO] client uid={uid} timed out (frames={frames} bytes={bytes})");
            }
        }
    }
}
