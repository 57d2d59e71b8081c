//! Startup configuration record: ports, paths, timeouts, caps.
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::net;

/// Command-line surface. Only fills in [`ServerConfig`]; everything not
/// exposed here keeps its default.
#[derive(Debug, Parser)]
#[command(name = "lan-collab-server", about = "LAN collaboration hub: chat, files, screen share, audio/video relay")]
pub struct Args {
    /// Host to bind all listeners to (default: primary local IPv4)
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// TCP port for the JSON control channel
    #[arg(long, default_value_t = 9000)]
    pub port: u16,

    /// UDP port for the audio mixer
    #[arg(long, default_value_t = 11000)]
    pub audio_port: u16,

    /// UDP port for video chunk ingress
    #[arg(long, default_value_t = 10000)]
    pub video_port: u16,

    /// Directory for uploaded files
    #[arg(long, default_value = "uploads")]
    pub upload_dir: PathBuf,
}

/// All tunables in one place. Components take what they need at
/// construction time; nothing reads scattered constants.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub control_port: u16,
    pub audio_port: u16,
    pub video_port: u16,
    /// Source port the video fan-out socket binds to, so passive LAN
    /// listeners see a well-known sender.
    pub video_broadcast_port: u16,
    pub upload_dir: PathBuf,

    // Control plane
    pub max_line_bytes: usize,
    pub chat_history: usize,

    // Transfer broker
    pub max_file_size: u64,
    pub transfer_deadline: Duration,
    pub file_chunk: usize,

    // Screen share
    pub share_deadline: Duration,
    pub max_share_frame: u32,

    // Media plane, shared
    pub client_timeout: Duration,
    pub evict_period: Duration,

    // Audio mixer
    pub mix_tick: Duration,
    pub max_late_ms: u64,
    pub mix_excludes_self: bool,

    // Video reassembly
    pub chunk_timeout: Duration,
    pub max_chunks: u32,
    pub max_chunk_size: u32,
    pub max_frame_size: u64,
    pub max_frames_per_client: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: net::primary_ipv4(),
            control_port: 9000,
            audio_port: 11000,
            video_port: 10000,
            video_broadcast_port: 10001,
            upload_dir: PathBuf::from("uploads"),
            max_line_bytes: 1024 * 1024,
            chat_history: 500,
            max_file_size: 2 * 1024 * 1024 * 1024,
            transfer_deadline: Duration::from_secs(300),
            file_chunk: 8192,
            share_deadline: Duration::from_secs(300),
            max_share_frame: 64 * 1024 * 1024,
            client_timeout: Duration::from_secs(10),
            evict_period: Duration::from_secs(5),
            mix_tick: Duration::from_millis(40),
            max_late_ms: 250,
            mix_excludes_self: false,
            chunk_timeout: Duration::from_secs(5),
            max_chunks: 100,
            max_chunk_size: 1024 * 1024,
            max_frame_size: 10 * 1024 * 1024,
            max_frames_per_client: 50,
        }
    }
}

impl ServerConfig {
    /// Merge parsed arguments over the defaults.
    pub fn from_args(args: Args) -> Self {
        let mut cfg = Self::default();
        if let Some(host) = args.host {
            cfg.host = host;
        }
        cfg.control_port = args.port;
        cfg.audio_port = args.audio_port;
        cfg.video_port = args.video_port;
        cfg.upload_dir = args.upload_dir;
        cfg
    }
}
