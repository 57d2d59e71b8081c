//! UDP audio mixer: per-sender Opus decode, 40 ms mix tick, single-encode
//! broadcast to every registered client address.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::protocol::AudioHeader;

pub const SAMPLE_RATE: u32 = 48_000;
/// 40 ms of mono audio at 48 kHz.
pub const FRAME_SAMPLES: usize = 1920;
const MAX_OPUS_PACKET: usize = 4000;
const PENDING_QUEUE: usize = 256;

/// How one datagram's sequence number relates to the sender's last accepted
/// one, under 32-bit serial-number arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
    Duplicate,
    InOrder,
    /// Forward jump; carries the number of packets lost in the gap.
    Gap(u32),
    Old,
}

/// Classify `seq` against the last accepted sequence number.
pub fn classify_seq(last_seq: u32, seq: u32) -> SeqVerdict {
    let diff = seq.wrapping_sub(last_seq);
    match diff {
        0 => SeqVerdict::Duplicate,
        1 => SeqVerdict::InOrder,
        d if d <= 1 << 31 => SeqVerdict::Gap(d - 1),
        _ => SeqVerdict::Old,
    }
}

/// Per-sender state. Created on first packet, evicted after the quiet
/// timeout; a re-appearing uid starts over with its expectation reset.
struct AudioClient {
    addr: SocketAddr,
    volume: f32,
    muted: bool,
    last_packet: Instant,
    last_seq: u32,
    last_ts_ms: u64,
    received: u64,
    dropped: u64,
}

impl AudioClient {
    fn new(addr: SocketAddr, seq: u32, ts_ms: u64) -> Self {
        Self {
            addr,
            volume: 1.0,
            muted: false,
            last_packet: Instant::now(),
            last_seq: seq,
            last_ts_ms: ts_ms,
            received: 1,
            dropped: 0,
        }
    }

    /// Sequence + late-packet admission for one datagram. Updates counters
    /// and, on acceptance, the sequence/timestamp expectations.
    fn admit(&mut self, seq: u32, ts_ms: u64, max_late_ms: u64) -> bool {
        self.last_packet = Instant::now();
        match classify_seq(self.last_seq, seq) {
            SeqVerdict::Duplicate | SeqVerdict::Old => {
                self.dropped += 1;
                return false;
            }
            SeqVerdict::InOrder => {}
            SeqVerdict::Gap(lost) => self.dropped += lost as u64,
        }
        // compare the sender's clock only against its own prior packets
        if ts_ms + max_late_ms < self.last_ts_ms {
            self.dropped += 1;
            return false;
        }
        self.last_seq = seq;
        self.last_ts_ms = self.last_ts_ms.max(ts_ms);
        self.received += 1;
        true
    }
}

/// One decoded, gain-applied frame awaiting the next mix tick.
struct PendingFrame {
    uid: u32,
    samples: Vec<f32>,
}

/// Sum frames, normalize by 1/sqrt(N), clip to [-1, 1]. N = number of
/// frames summed; sqrt keeps many speakers audible where 1/N would not.
pub fn mix(frames: &[Vec<f32>]) -> Vec<f32> {
    let mut acc = vec![0f32; FRAME_SAMPLES];
    let mut n = 0usize;
    for frame in frames {
        if frame.len() != FRAME_SAMPLES {
            continue;
        }
        for (a, s) in acc.iter_mut().zip(frame) {
            *a += s;
        }
        n += 1;
    }
    if n > 1 {
        let norm = 1.0 / (n as f32).sqrt();
        for a in acc.iter_mut() {
            *a *= norm;
        }
    }
    for a in acc.iter_mut() {
        *a = a.clamp(-1.0, 1.0);
    }
    acc
}

/// The audio plane: ingress thread, mix-tick thread, eviction thread.
pub struct AudioMixer {
    running: Arc<AtomicBool>,
    clients: Arc<Mutex<HashMap<u32, AudioClient>>>,
    queue_drops: Arc<AtomicU64>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    pub local_addr: SocketAddr,
}

impl AudioMixer {
    /// Bind the audio port and spawn the three worker threads. The mixer
    /// runs until [`AudioMixer::stop`].
    pub fn start(cfg: &ServerConfig) -> Result<Self> {
        let socket = UdpSocket::bind((cfg.host, cfg.audio_port))
            .with_context(|| format!("bind audio udp {}:{}", cfg.host, cfg.audio_port))?;
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .context("audio socket read timeout")?;
        let local_addr = socket.local_addr().context("audio local_addr")?;
        let send_socket = socket.try_clone().context("clone audio socket")?;

        // encoder is created up front so a missing codec fails startup, not
        // the first tick
        let encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .context("create opus encoder")?;

        let running = Arc::new(AtomicBool::new(true));
        let clients: Arc<Mutex<HashMap<u32, AudioClient>>> = Arc::new(Mutex::new(HashMap::new()));
        let queue_drops = Arc::new(AtomicU64::new(0));
        let (pending_tx, pending_rx) = bounded::<PendingFrame>(PENDING_QUEUE);

        info!("[AUDIO] mixer listening on {local_addr}");

        let mut threads = Vec::new();
        {
            let running = running.clone();
            let clients = clients.clone();
            let queue_drops = queue_drops.clone();
            let max_late_ms = cfg.max_late_ms;
            threads.push(
                thread::Builder::new()
                    .name("audio-ingress".into())
                    .spawn(move || ingress_loop(socket, running, clients, pending_tx, queue_drops, max_late_ms))
                    .context("spawn audio ingress thread")?,
            );
        }
        {
            let running = running.clone();
            let clients = clients.clone();
            let tick = cfg.mix_tick;
            let excludes_self = cfg.mix_excludes_self;
            threads.push(
                thread::Builder::new()
                    .name("audio-mix".into())
                    .spawn(move || mix_loop(send_socket, running, clients, pending_rx, encoder, tick, excludes_self))
                    .context("spawn audio mix thread")?,
            );
        }
        {
            let running = running.clone();
            let clients = clients.clone();
            let timeout = cfg.client_timeout;
            let period = cfg.evict_period;
            threads.push(
                thread::Builder::new()
                    .name("audio-evict".into())
                    .spawn(move || evict_loop(running, clients, timeout, period))
                    .context("spawn audio evict thread")?,
            );
        }

        Ok(Self { running, clients, queue_drops, threads: Mutex::new(threads), local_addr })
    }

    /// Flip the stop flag; every thread observes it within one tick or one
    /// socket timeout.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn join(&self) {
        self.stop();
        for t in self.threads.lock().drain(..) {
            let _ = t.join();
        }
    }

    pub fn set_volume(&self, uid: u32, volume: f32) {
        if let Some(c) = self.clients.lock().get_mut(&uid) {
            c.volume = volume.clamp(0.0, 1.0);
        }
    }

    pub fn set_muted(&self, uid: u32, muted: bool) {
        if let Some(c) = self.clients.lock().get_mut(&uid) {
            c.muted = muted;
        }
    }

    /// (received, dropped) counters for one sender.
    pub fn stats(&self, uid: u32) -> Option<(u64, u64)> {
        self.clients.lock().get(&uid).map(|c| (c.received, c.dropped))
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Leave cascade: forget the user's audio state immediately instead of
    /// waiting out the quiet timeout.
    pub fn handle_user_left(&self, uid: u32) {
        self.clients.lock().remove(&uid);
    }

    pub fn queue_drops(&self) -> u64 {
        self.queue_drops.load(Ordering::Relaxed)
    }
}

/// Receive datagrams, admit them, decode, apply gain, queue for the mixer.
/// Decoders are owned here: one per uid, never shared across threads.
fn ingress_loop(
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    clients: Arc<Mutex<HashMap<u32, AudioClient>>>,
    pending_tx: Sender<PendingFrame>,
    queue_drops: Arc<AtomicU64>,
    max_late_ms: u64,
) {
    let mut buf = [0u8; 65536];
    let mut decoders: HashMap<u32, opus::Decoder> = HashMap::new();
    let mut pcm = vec![0f32; FRAME_SAMPLES];
    let mut last_prune = Instant::now();

    while running.load(Ordering::Relaxed) {
        let (n, src) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                prune_decoders(&mut decoders, &clients, &mut last_prune);
                continue;
            }
            Err(e) => {
                if running.load(Ordering::Relaxed) {
                    warn!("[AUDIO] recv error: {e}");
                }
                continue;
            }
        };

        let Some((header, payload)) = AudioHeader::parse(&buf[..n]) else {
            continue; // short datagram, silent drop
        };

        // admit under the table lock, copy gain state, release before decode
        let (volume, muted) = {
            let mut table = clients.lock();
            match table.get_mut(&header.uid) {
                Some(rec) => {
                    rec.addr = src;
                    if !rec.admit(header.seq, header.timestamp_ms, max_late_ms) {
                        continue;
                    }
                    (rec.volume, rec.muted)
                }
                None => {
                    info!("[AUDIO] new client: uid={} from {src}", header.uid);
                    let rec = AudioClient::new(src, header.seq, header.timestamp_ms);
                    let gain = (rec.volume, rec.muted);
                    table.insert(header.uid, rec);
                    gain
                }
            }
        };

        let decoder = match decoders.entry(header.uid) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(slot) => match opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono) {
                Ok(d) => slot.insert(d),
                Err(e) => {
                    warn!("[AUDIO] decoder create failed for uid={}: {e}", header.uid);
                    continue;
                }
            },
        };
        let samples = match decoder.decode_float(payload, &mut pcm, false) {
            Ok(samples) => samples,
            Err(e) => {
                debug!("[AUDIO] decode failed for uid={}: {e}", header.uid);
                continue;
            }
        };
        if samples != FRAME_SAMPLES {
            debug!("[AUDIO] uid={} decoded {samples} samples, want {FRAME_SAMPLES}; dropped", header.uid);
            continue;
        }

        let samples = if muted {
            vec![0f32; FRAME_SAMPLES]
        } else if (volume - 1.0).abs() < f32::EPSILON {
            pcm.clone()
        } else {
            pcm.iter().map(|s| s * volume).collect()
        };
        if pending_tx.try_send(PendingFrame { uid: header.uid, samples }).is_err() {
            queue_drops.fetch_add(1, Ordering::Relaxed);
        }

        prune_decoders(&mut decoders, &clients, &mut last_prune);
    }
}

fn prune_decoders(
    decoders: &mut HashMap<u32, opus::Decoder>,
    clients: &Arc<Mutex<HashMap<u32, AudioClient>>>,
    last_prune: &mut Instant,
) {
    if last_prune.elapsed() < Duration::from_secs(5) {
        return;
    }
    *last_prune = Instant::now();
    let live: Vec<u32> = clients.lock().keys().copied().collect();
    decoders.retain(|uid, _| live.contains(uid));
}

/// The fixed-cadence mix loop. Schedule stability wins over everything
/// else here: no per-recipient work in the default mode, logging only at
/// debug level.
fn mix_loop(
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    clients: Arc<Mutex<HashMap<u32, AudioClient>>>,
    pending_rx: Receiver<PendingFrame>,
    mut encoder: opus::Encoder,
    tick: Duration,
    excludes_self: bool,
) {
    let mut out = [0u8; MAX_OPUS_PACKET];
    let mut next_tick = Instant::now() + tick;

    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now < next_tick {
            thread::sleep(next_tick - now);
        }
        next_tick += tick;

        // drain everything queued since the previous tick
        let mut frames: Vec<(u32, Vec<f32>)> = Vec::new();
        while let Ok(frame) = pending_rx.try_recv() {
            frames.push((frame.uid, frame.samples));
        }

        let targets: Vec<(u32, SocketAddr)> =
            clients.lock().iter().map(|(uid, c)| (*uid, c.addr)).collect();
        if targets.is_empty() {
            continue;
        }

        if !excludes_self {
            let only: Vec<Vec<f32>> = frames.into_iter().map(|(_, s)| s).collect();
            let mixed = mix(&only);
            match encoder.encode_float(&mixed, &mut out) {
                Ok(len) => {
                    debug!("[AUDIO] tick: {} frames mixed, {len} bytes to {} clients", only.len(), targets.len());
                    for (_, addr) in &targets {
                        if let Err(e) = socket.send_to(&out[..len], addr) {
                            debug!("[AUDIO] send to {addr} failed: {e}");
                        }
                    }
                }
                Err(e) => warn!("[AUDIO] encode failed: {e}"),
            }
        } else {
            // optional mode: each recipient hears everyone but themselves
            for (uid, addr) in &targets {
                let others: Vec<Vec<f32>> =
                    frames.iter().filter(|(f_uid, _)| f_uid != uid).map(|(_, s)| s.clone()).collect();
                let mixed = mix(&others);
                match encoder.encode_float(&mixed, &mut out) {
                    Ok(len) => {
                        if let Err(e) = socket.send_to(&out[..len], addr) {
                            debug!("[AUDIO] send to {addr} failed: {e}");
                        }
                    }
                    Err(e) => warn!("[AUDIO] encode failed: {e}"),
                }
            }
        }
    }
}

/// Periodic quiet-timeout sweep. Sleeps in short steps so the stop flag is
/// observed promptly.
fn evict_loop(
    running: Arc<AtomicBool>,
    clients: Arc<Mutex<HashMap<u32, AudioClient>>>,
    timeout: Duration,
    period: Duration,
) {
    let step = Duration::from_millis(100).min(period);
    let mut slept = Duration::ZERO;
    while running.load(Ordering::Relaxed) {
        thread::sleep(step);
        slept += step;
        if slept < period {
            continue;
        }
        slept = Duration::ZERO;
        let mut stale = Vec::new();
        {
            let mut table = clients.lock();
            table.retain(|uid, c| {
                if c.last_packet.elapsed() > timeout {
                    stale.push((*uid, c.received, c.dropped));
                    false
                } else {
                    true
                }
            });
        }
        for (uid, received, dropped) in stale {
            info!("[AUDIO] client uid={uid} timed out (received={received} dropped={dropped})");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn seq_classification_window() {
        assert_eq!(classify_seq(10, 10), SeqVerdict::Duplicate);
        assert_eq!(classify_seq(10, 11), SeqVerdict::InOrder);
        assert_eq!(classify_seq(10, 15), SeqVerdict::Gap(4));
        assert_eq!(classify_seq(10, 9), SeqVerdict::Old);
        assert_eq!(classify_seq(10, 5), SeqVerdict::Old);
        // wrap-around stays in order
        assert_eq!(classify_seq(u32::MAX, 0), SeqVerdict::InOrder);
        assert_eq!(classify_seq(u32::MAX, 3), SeqVerdict::Gap(3));
        // exactly 2^31 ahead counts as forward, one past it as old
        assert_eq!(classify_seq(0, 1 << 31), SeqVerdict::Gap((1 << 31) - 1));
        assert_eq!(classify_seq(0, (1 << 31) + 1), SeqVerdict::Old);
    }

    fn rec() -> AudioClient {
        AudioClient::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5000), 0, 1000)
    }

    #[test]
    fn in_order_packets_all_accepted() {
        let mut c = rec();
        for seq in 1..=24u32 {
            assert!(c.admit(seq, 1000 + seq as u64 * 40, 250));
        }
        assert_eq!(c.received, 25); // 24 admitted + the creation packet
        assert_eq!(c.dropped, 0);
    }

    #[test]
    fn gap_counts_losses_and_accepts() {
        let mut c = rec();
        assert!(c.admit(5, 1200, 250)); // seqs 1..=4 lost
        assert_eq!(c.dropped, 4);
        assert_eq!(c.received, 2);
        assert_eq!(c.last_seq, 5);
    }

    #[test]
    fn duplicate_and_old_are_dropped() {
        let mut c = rec();
        assert!(c.admit(1, 1040, 250));
        assert!(!c.admit(1, 1040, 250)); // duplicate
        assert!(!c.admit(0, 1000, 250)); // old
        assert_eq!(c.dropped, 2);
        assert_eq!(c.received, 2);
    }

    #[test]
    fn late_timestamp_is_dropped() {
        let mut c = rec();
        assert!(c.admit(1, 10_000, 250));
        // more than 250 ms behind the newest accepted timestamp
        assert!(!c.admit(2, 9_700, 250));
        assert_eq!(c.dropped, 1);
        // within the window is fine
        assert!(c.admit(3, 9_800, 250));
        // newest timestamp is retained, not regressed
        assert_eq!(c.last_ts_ms, 10_000);
    }

    #[test]
    fn mix_single_frame_passes_through() {
        let frame = vec![0.25f32; FRAME_SAMPLES];
        let mixed = mix(&[frame.clone()]);
        assert_eq!(mixed, frame);
    }

    #[test]
    fn mix_normalizes_by_sqrt_and_clips() {
        let a = vec![0.8f32; FRAME_SAMPLES];
        let b = vec![0.8f32; FRAME_SAMPLES];
        let mixed = mix(&[a, b]);
        // 1.6 / sqrt(2) > 1.0, so the sum clips
        assert!(mixed.iter().all(|&s| s == 1.0));

        let a = vec![0.3f32; FRAME_SAMPLES];
        let b = vec![0.3f32; FRAME_SAMPLES];
        let mixed = mix(&[a, b]);
        let expect = 0.6 / 2f32.sqrt();
        assert!((mixed[0] - expect).abs() < 1e-6);
    }

    #[test]
    fn mix_skips_wrong_length_frames() {
        let good = vec![0.5f32; FRAME_SAMPLES];
        let bad = vec![0.5f32; 960];
        let mixed = mix(&[bad, good.clone()]);
        assert_eq!(mixed, good);
    }

    #[test]
    fn mix_of_nothing_is_silence() {
        let mixed = mix(&[]);
        assert_eq!(mixed.len(), FRAME_SAMPLES);
        assert!(mixed.iter().all(|&s| s == 0.0));
    }

    fn test_cfg() -> ServerConfig {
        let mut cfg = ServerConfig::default();
        cfg.host = IpAddr::V4(Ipv4Addr::LOCALHOST);
        cfg.audio_port = 0; // OS-assigned, tests run in parallel
        cfg
    }

    fn tone_packet(encoder: &mut opus::Encoder, seq: u32, ts: u64, uid: u32) -> Vec<u8> {
        let pcm: Vec<f32> = (0..FRAME_SAMPLES)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / SAMPLE_RATE as f32).sin() * 0.5)
            .collect();
        let mut out = [0u8; MAX_OPUS_PACKET];
        let len = encoder.encode_float(&pcm, &mut out).unwrap();
        AudioHeader { seq, timestamp_ms: ts, uid }.encode(&out[..len])
    }

    #[test]
    fn speaker_receives_non_silent_mix() {
        let mixer = AudioMixer::start(&test_cfg()).unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let mut enc =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip).unwrap();

        for seq in 0..5u32 {
            let pkt = tone_packet(&mut enc, seq, 1000 + seq as u64 * 40, 1);
            client.send_to(&pkt, mixer.local_addr).unwrap();
            thread::sleep(Duration::from_millis(40));
        }

        let mut dec = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono).unwrap();
        let mut buf = [0u8; MAX_OPUS_PACKET];
        let mut pcm = vec![0f32; FRAME_SAMPLES];
        let mut heard_signal = false;
        for _ in 0..10 {
            let Ok((n, _)) = client.recv_from(&mut buf) else { break };
            let samples = dec.decode_float(&buf[..n], &mut pcm, false).unwrap();
            let energy: f32 = pcm[..samples].iter().map(|s| s * s).sum();
            if energy > 0.01 {
                heard_signal = true;
                break;
            }
        }
        assert!(heard_signal, "expected at least one non-silent mixed frame");
        assert_eq!(mixer.stats(1).map(|(r, _)| r), Some(5));
        mixer.join();
    }

    #[test]
    fn quiet_client_is_evicted() {
        let mut cfg = test_cfg();
        cfg.client_timeout = Duration::from_millis(200);
        cfg.evict_period = Duration::from_millis(50);
        let mixer = AudioMixer::start(&cfg).unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut enc =
            opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip).unwrap();
        client.send_to(&tone_packet(&mut enc, 0, 1000, 7), mixer.local_addr).unwrap();

        // wait for the record to appear, then to be evicted
        for _ in 0..20 {
            if mixer.client_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(mixer.client_count(), 1);
        for _ in 0..30 {
            if mixer.client_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(mixer.client_count(), 0);
        mixer.join();
    }
}
