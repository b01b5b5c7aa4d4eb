//! Bridge server
//!
//! Unix domain socket server on the privileged side. Every accepted connection
//! is one page with its own [`Host`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_net::unix::{UnixListener, UnixStream};
use executor_core::{Executor, Task};
use futures_lite::future;
use smol::channel::{Receiver, Sender, unbounded};

use crate::host::{Host, HostBuilder};
use crate::ipc::protocol::{Frame, HostEvent, IpcError, read_frame, write_frame};
use crate::sync::lock;

type Pages = Mutex<HashMap<u64, Arc<Host>>>;

/// Server that hands each connecting page a fresh host
pub struct BridgeServer {
    socket_path: PathBuf,
    running: Arc<AtomicBool>,
    pages: Arc<Pages>,
}

impl BridgeServer {
    /// Create and start a new bridge server
    ///
    /// # Arguments
    /// * `hosts` - Builder used for every connecting page
    /// * `socket_path` - Path for the Unix domain socket
    /// * `executor` - Executor to spawn the server tasks on
    pub async fn new<E: Executor + Clone + 'static>(
        hosts: HostBuilder,
        socket_path: impl AsRef<Path>,
        executor: E,
    ) -> Result<Self, IpcError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let running = Arc::new(AtomicBool::new(true));
        let pages: Arc<Pages> = Arc::new(Mutex::new(HashMap::new()));

        // A stale socket from a previous run would make bind fail
        let _ = std::fs::remove_file(&socket_path);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        tracing::info!(path = %socket_path.display(), "bridge server started");

        executor
            .spawn(run_server(
                listener,
                hosts,
                Arc::clone(&pages),
                Arc::clone(&running),
                executor.clone(),
            ))
            .detach();

        Ok(Self {
            socket_path,
            running,
            pages,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of pages currently connected
    pub fn pages(&self) -> usize {
        lock(&self.pages).len()
    }

    /// Push an event to every connected page, returning how many were reached
    pub fn broadcast(&self, event: HostEvent) -> usize {
        let pages = lock(&self.pages);
        tracing::debug!(event = event.name(), pages = pages.len(), "broadcasting host event");
        for host in pages.values() {
            host.emit(event.clone());
        }
        pages.len()
    }

    /// Stop accepting new pages
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::debug!(path = %self.socket_path.display(), "bridge server stopping");
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        self.stop();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

async fn run_server<E: Executor + Clone + 'static>(
    listener: UnixListener,
    hosts: HostBuilder,
    pages: Arc<Pages>,
    running: Arc<AtomicBool>,
    executor: E,
) {
    let next_page = AtomicU64::new(0);
    while running.load(Ordering::SeqCst) {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let page = next_page.fetch_add(1, Ordering::Relaxed);
                executor
                    .spawn(handle_connection(
                        stream,
                        page,
                        hosts.clone(),
                        Arc::clone(&pages),
                        executor.clone(),
                    ))
                    .detach();
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "failed to accept page connection");
                }
            }
        }
    }
}

async fn handle_connection<E: Executor + Clone + 'static>(
    stream: UnixStream,
    page: u64,
    hosts: HostBuilder,
    pages: Arc<Pages>,
    executor: E,
) {
    let (outbound, frames) = unbounded::<Frame>();
    executor.spawn(write_frames(stream.clone(), frames)).detach();

    let host = hosts.build(outbound.clone());
    lock(&pages).insert(page, Arc::clone(&host));
    tracing::info!(page, "page connected");

    let max_len = hosts.bridge_config().max_frame_len();
    future::or(
        serve_requests(stream, &host, outbound, max_len),
        host.run_finalizers(),
    )
    .await;

    lock(&pages).remove(&page);
    let released = host.teardown();
    tracing::info!(page, released, "page disconnected");
}

/// Answer requests in arrival order until the page hangs up
async fn serve_requests(mut stream: UnixStream, host: &Host, outbound: Sender<Frame>, max_len: usize) {
    loop {
        let frame = match read_frame(&mut stream, max_len).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read page frame");
                break;
            }
        };

        let Frame::Request { id, channel, args } = frame else {
            tracing::warn!("page sent a non-request frame");
            continue;
        };

        let result = host.dispatch(&channel, args).await.map_err(|e| {
            tracing::debug!(channel = %channel, error = %e, "page call rejected");
            e.to_string()
        });
        if outbound.send(Frame::Response { id, result }).await.is_err() {
            break;
        }
    }
}

/// Drain `frames` onto the socket, closing the write half once the queue closes
pub(crate) async fn write_frames(mut stream: UnixStream, frames: Receiver<Frame>) {
    while let Ok(frame) = frames.recv().await {
        if let Err(e) = write_frame(&mut stream, &frame).await {
            tracing::debug!(error = %e, "failed to write frame");
            break;
        }
    }
    let _ = stream.shutdown(std::net::Shutdown::Write);
}
