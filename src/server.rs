//! Server assembly: wires the registry, control plane, transfer broker,
//! screen relay, and media plane together and owns shutdown.
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::task::AbortHandle;

use crate::audio::AudioMixer;
use crate::chat::ChatLog;
use crate::config::ServerConfig;
use crate::control::ControlPlane;
use crate::files::TransferBroker;
use crate::registry::Registry;
use crate::screen::ScreenShare;
use crate::video::VideoRelay;

/// One running server instance. The media plane is best-effort: a busy
/// audio or video port degrades the hub to chat/files/screen instead of
/// failing startup.
pub struct CollaborationServer {
    pub control_port: u16,
    plane: Arc<ControlPlane>,
    registry: Arc<Registry>,
    files: Arc<TransferBroker>,
    screen: Arc<ScreenShare>,
    audio: Option<Arc<AudioMixer>>,
    video: Option<Arc<VideoRelay>>,
    accept_task: AbortHandle,
}

impl CollaborationServer {
    /// Bind everything and start serving. Returns once all listeners are
    /// up; the work happens on spawned tasks and threads.
    pub async fn start(cfg: ServerConfig) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let chat = Arc::new(ChatLog::new(cfg.chat_history));
        let files = Arc::new(TransferBroker::new(&cfg, Arc::clone(&registry))?);
        let screen = Arc::new(ScreenShare::new(&cfg, Arc::clone(&registry)));

        let audio = match AudioMixer::start(&cfg) {
            Ok(mixer) => Some(Arc::new(mixer)),
            Err(e) => {
                warn!("[SERVER] audio mixer unavailable: {e:#}");
                None
            }
        };
        let video = match VideoRelay::start(&cfg).await {
            Ok(relay) => Some(Arc::new(relay)),
            Err(e) => {
                warn!("[SERVER] video relay unavailable: {e:#}");
                None
            }
        };

        let listener = TcpListener::bind((cfg.host, cfg.control_port))
            .await
            .with_context(|| format!("bind control tcp {}:{}", cfg.host, cfg.control_port))?;
        let control_port = listener.local_addr().context("control local_addr")?.port();
        info!("[SERVER] control listening on {}:{control_port}", cfg.host);

        let plane = Arc::new(ControlPlane::new(
            &cfg,
            Arc::clone(&registry),
            chat,
            Arc::clone(&files),
            Arc::clone(&screen),
            audio.clone(),
            video.clone(),
        ));
        let accept_task = tokio::spawn(Arc::clone(&plane).run(listener)).abort_handle();

        Ok(Self { control_port, plane, registry, files, screen, audio, video, accept_task })
    }

    /// Orderly teardown: stop accepting, cancel transfers (removing partial
    /// uploads), end presentations, stop both media paths, close control
    /// connections.
    pub fn shutdown(&self) {
        info!("[SERVER] shutting down");
        self.accept_task.abort();
        self.files.shutdown();
        self.screen.shutdown();
        if let Some(audio) = &self.audio {
            audio.join();
        }
        if let Some(video) = &self.video {
            video.stop();
        }
        for (uid, _) in self.registry.handles() {
            self.plane.disconnect(uid);
        }
    }
}
