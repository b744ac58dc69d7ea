//! TCP accept loop and connection lifecycle.
//!
//! The listener and connection caps run on the async runtime; each accepted
//! connection is handed a plain blocking socket and served on a blocking
//! task, because a session is strictly sequential and spends its time in
//! file I/O.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use ps3net_fs::{RootFs, Vfs};

use crate::config::ServerConfig;
use crate::session::Session;

/// Deadline for writing a reply to a slow client.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Directories with more entries than this get a startup warning; console
/// clients enumerate them painfully slowly.
const DIR_WARN_ENTRIES: usize = 4096;

pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting new connections. In-flight sessions run to completion
    /// or die by their own read deadlines.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub async fn start_server(cfg: ServerConfig) -> anyhow::Result<ServerHandle> {
    let root = RootFs::new(&cfg.root)?;
    spawn_oversize_scan(cfg.root.clone());
    let vfs = Arc::new(Vfs::new(root));

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(
        addr = %addr,
        root = %cfg.root.display(),
        allow_write = cfg.allow_write,
        "listening"
    );

    let connections =
        (cfg.max_clients != 0).then(|| Arc::new(Semaphore::new(cfg.max_clients)));

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };

            if let Some(whitelist) = &cfg.client_whitelist {
                if !whitelist.contains(peer.ip()) {
                    tracing::info!(peer = %peer, "connection refused by whitelist");
                    continue;
                }
            }

            let permit = match &connections {
                None => None,
                Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        tracing::warn!(peer = %peer, "max clients exceeded");
                        continue;
                    }
                },
            };

            let vfs = vfs.clone();
            let allow_write = cfg.allow_write;
            let buffer_size = cfg.buffer_size;
            let read_timeout = cfg.read_timeout;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                serve_conn(stream, peer, vfs, allow_write, buffer_size, read_timeout);
            });
        }
    });

    Ok(ServerHandle {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

fn serve_conn(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    vfs: Arc<Vfs>,
    allow_write: bool,
    buffer_size: usize,
    read_timeout: Duration,
) {
    let span = tracing::info_span!("conn", peer = %peer);
    let _guard = span.enter();

    let stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(error = %err, "failed to detach socket");
            return;
        }
    };

    // The session does blocking I/O with a per-command read deadline.
    let deadline = (read_timeout > Duration::ZERO).then_some(read_timeout);
    if let Err(err) = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(deadline))
        .and_then(|_| stream.set_write_timeout(Some(WRITE_TIMEOUT)))
    {
        tracing::warn!(error = %err, "failed to configure socket");
        return;
    }

    tracing::info!("client connected");
    match Session::new(vfs, allow_write, buffer_size).run(stream) {
        Ok(()) => tracing::info!("client disconnected"),
        Err(err) => {
            let chain = format!("{err:#}");
            tracing::warn!(error = %chain, "session aborted");
        }
    }
}

/// One-shot advisory walk warning about directories that will enumerate
/// slowly on console clients.
fn spawn_oversize_scan(root: std::path::PathBuf) {
    tokio::task::spawn_blocking(move || {
        for entry in walkdir::WalkDir::new(&root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let count = match std::fs::read_dir(entry.path()) {
                Ok(iter) => iter.count(),
                Err(_) => continue,
            };
            if count > DIR_WARN_ENTRIES {
                tracing::warn!(
                    path = %entry.path().display(),
                    entries = count,
                    "directory is very large; console browsing will be slow"
                );
            }
        }
    });
}
