mod audio; mod chat; mod config; mod control; mod files; mod net; mod protocol; mod registry; mod screen; mod server; mod video;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::config::{Args, ServerConfig};
use crate::server::CollaborationServer;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = ServerConfig::from_args(Args::parse());
    info!(
        "[SERVER] starting on {} (control {}, audio {}, video {}, uploads {})",
        cfg.host,
        cfg.control_port,
        cfg.audio_port,
        cfg.video_port,
        cfg.upload_dir.display()
    );

    let server = CollaborationServer::start(cfg).await?;
    tokio::signal::ctrl_c().await?;
    server.shutdown();
    info!("[SERVER] stopped");
    Ok(())
}
