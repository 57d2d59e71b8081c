//! Transfer broker: per-transfer ephemeral TCP ports streaming to/from disk.
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::config::ServerConfig;
use crate::net;
use crate::protocol::{now_iso, ControlError, ServerMessage};
use crate::registry::Registry;

/// Metadata for one fully uploaded file.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub fid: String,
    pub filename: String,
    pub size: u64,
    pub uploader: String,
    pub uploader_uid: u32,
    pub path: PathBuf,
    pub uploaded_at: String,
}

/// Allocates one-shot upload/download listeners and owns the file table.
/// Every transfer runs as its own task under a 5-minute deadline; a user
/// leaving aborts that user's pending transfers.
pub struct TransferBroker {
    registry: Arc<Registry>,
    host: IpAddr,
    upload_dir: PathBuf,
    max_file_size: u64,
    deadline: Duration,
    chunk: usize,
    files: DashMap<String, FileRecord>,
    sessions: Mutex<HashMap<u32, Vec<AbortHandle>>>,
}

/// Deletes the on-disk file on drop unless disarmed. Shared cleanup for
/// short reads, disk errors, deadline expiry, and task abort.
struct PartialGuard {
    path: PathBuf,
    armed: bool,
}

impl PartialGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PartialGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("[FILES] failed to remove partial {}: {e}", self.path.display());
                }
            }
        }
    }
}

/// Strip directory components so the stored name is a bare file name.
/// Returns None for names that have no usable basename.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or("");
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}

impl TransferBroker {
    pub fn new(cfg: &ServerConfig, registry: Arc<Registry>) -> Result<Self> {
        std::fs::create_dir_all(&cfg.upload_dir)
            .with_context(|| format!("create upload dir {}", cfg.upload_dir.display()))?;
        Ok(Self {
            registry,
            host: cfg.host,
            upload_dir: cfg.upload_dir.clone(),
            max_file_size: cfg.max_file_size,
            deadline: cfg.transfer_deadline,
            chunk: cfg.file_chunk,
            files: DashMap::new(),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn lookup(&self, fid: &str) -> Option<FileRecord> {
        self.files.get(fid).map(|r| r.clone())
    }

    /// `file_offer`: validate, open a one-shot upload listener, reply with
    /// the port, and receive the bytes in the background.
    pub async fn handle_offer(
        self: &Arc<Self>,
        uid: u32,
        fid: String,
        filename: String,
        size: u64,
    ) {
        let Some(filename) = sanitize_filename(&filename) else {
            self.registry.send_to(uid, &ControlError::InvalidFileOffer.reply());
            return;
        };
        if fid.is_empty() || size == 0 || size > self.max_file_size {
            self.registry.send_to(uid, &ControlError::InvalidFileOffer.reply());
            return;
        }
        let uploader = self.registry.resolve(uid).unwrap_or_else(|| format!("user_{uid}"));

        let (listener, port) = match net::bind_ephemeral(self.host).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("[FILES] upload listener bind failed: {e:#}");
                self.registry.send_to(uid, &ControlError::UploadUnavailable.reply());
                return;
            }
        };
        info!("[FILES] upload port {port} open for fid={fid} ({filename}, {size} bytes) from {uploader}");
        self.registry.send_to(uid, &ServerMessage::FileUploadPort { fid: fid.clone(), port });

        let broker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = timeout(
                broker.deadline,
                broker.run_upload(listener, uid, &uploader, &fid, &filename, size),
            )
            .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[FILES] upload fid={fid} aborted: {e:#}"),
                Err(_) => warn!("[FILES] upload port for fid={fid} timed out and closed"),
            }
        });
        self.track(uid, handle.abort_handle());
    }

    async fn run_upload(
        self: &Arc<Self>,
        listener: tokio::net::TcpListener,
        uid: u32,
        uploader: &str,
        fid: &str,
        filename: &str,
        size: u64,
    ) -> Result<()> {
        let (stream, peer) = listener.accept().await.context("accept upload connection")?;
        // one-shot: no further accepts on this port
        drop(listener);
        info!("[FILES] upload connection from {peer} for fid={fid}");

        let path = self.upload_dir.join(filename);
        let mut guard = PartialGuard::new(path.clone());
        self.receive_exact(stream, &path, fid, size).await?;

        let record = FileRecord {
            fid: fid.to_string(),
            filename: filename.to_string(),
            size,
            uploader: uploader.to_string(),
            uploader_uid: uid,
            path,
            uploaded_at: now_iso(),
        };
        guard.disarm();
        self.files.insert(fid.to_string(), record);
        info!("[FILES] upload complete: {filename} ({size} bytes, fid={fid}) by {uploader}");
        self.registry.broadcast(
            &ServerMessage::FileAvailable {
                fid: fid.to_string(),
                filename: filename.to_string(),
                size,
                uploader: uploader.to_string(),
                timestamp: now_iso(),
            },
            None,
        );
        Ok(())
    }

    async fn receive_exact(&self, mut stream: TcpStream, path: &Path, fid: &str, size: u64) -> Result<()> {
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("create {}", path.display()))?;
        let mut buf = vec![0u8; self.chunk];
        let mut received: u64 = 0;
        let mut next_mark: u64 = 1024 * 1024;
        while received < size {
            let want = buf.len().min((size - received) as usize);
            let n = stream.read(&mut buf[..want]).await.context("read upload bytes")?;
            if n == 0 {
                bail!("connection closed before upload complete: {received}/{size} bytes");
            }
            file.write_all(&buf[..n]).await.context("write upload bytes")?;
            received += n as u64;
            if received >= next_mark {
                info!(
                    "[FILES] upload progress [{fid}]: {received}/{size} bytes ({:.1}%)",
                    received as f64 / size as f64 * 100.0
                );
                next_mark += 1024 * 1024;
            }
        }
        file.flush().await.context("flush upload")?;
        Ok(())
    }

    /// `file_request`: look the fid up, open a one-shot download listener,
    /// reply with the port, and stream the bytes out in the background.
    pub async fn handle_request(self: &Arc<Self>, uid: u32, fid: String) {
        if fid.is_empty() {
            self.registry.send_to(uid, &ControlError::InvalidFileRequest.reply());
            return;
        }
        let Some(record) = self.lookup(&fid) else {
            self.registry.send_to(uid, &ControlError::FileNotFound(fid).reply());
            return;
        };

        let (listener, port) = match net::bind_ephemeral(self.host).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("[FILES] download listener bind failed: {e:#}");
                self.registry.send_to(uid, &ControlError::DownloadUnavailable.reply());
                return;
            }
        };
        info!("[FILES] download port {port} open for fid={fid} ({})", record.filename);
        self.registry.send_to(
            uid,
            &ServerMessage::FileDownloadPort {
                fid: fid.clone(),
                filename: record.filename.clone(),
                size: record.size,
                port,
            },
        );

        let broker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = timeout(broker.deadline, broker.run_download(listener, &record)).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("[FILES] download fid={fid} aborted: {e:#}"),
                Err(_) => warn!("[FILES] download port for fid={fid} timed out and closed"),
            }
        });
        self.track(uid, handle.abort_handle());
    }

    async fn run_download(&self, listener: tokio::net::TcpListener, record: &FileRecord) -> Result<()> {
        let (mut stream, peer) = listener.accept().await.context("accept download connection")?;
        drop(listener);
        info!("[FILES] download connection from {peer} for fid={}", record.fid);

        let mut file = tokio::fs::File::open(&record.path)
            .await
            .with_context(|| format!("open {}", record.path.display()))?;
        let mut buf = vec![0u8; self.chunk];
        let mut sent: u64 = 0;
        let mut next_mark: u64 = 1024 * 1024;
        loop {
            let n = file.read(&mut buf).await.context("read file bytes")?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await.context("write download bytes")?;
            sent += n as u64;
            if sent >= next_mark {
                info!(
                    "[FILES] download progress [{}]: {sent}/{} bytes ({:.1}%)",
                    record.fid,
                    record.size,
                    sent as f64 / record.size as f64 * 100.0
                );
                next_mark += 1024 * 1024;
            }
        }
        stream.shutdown().await.ok();
        info!("[FILES] download complete: {} ({sent} bytes) for fid={}", record.filename, record.fid);
        Ok(())
    }

    fn track(&self, uid: u32, handle: AbortHandle) {
        let mut sessions = self.sessions.lock();
        let list = sessions.entry(uid).or_default();
        list.retain(|h| !h.is_finished());
        list.push(handle);
    }

    /// Cancel every pending transfer owned by a departing user. Aborted
    /// upload tasks drop their [`PartialGuard`], removing partial files.
    pub fn handle_user_left(&self, uid: u32) {
        let handles = self.sessions.lock().remove(&uid);
        if let Some(handles) = handles {
            for h in handles {
                h.abort();
            }
        }
    }

    /// Abort all pending transfers (shutdown path).
    pub fn shutdown(&self) {
        let mut sessions = self.sessions.lock();
        for (_, handles) in sessions.drain() {
            for h in handles {
                h.abort();
            }
        }
    }
}
