//! Page-side transport over the bridge socket

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_net::unix::UnixStream;
use executor_core::{Executor, Task};
use serde_json::Value;
use smol::channel::{Receiver, Sender, bounded, unbounded};

use crate::error::{BridgeError, BridgeResult};
use crate::ipc::protocol::{DEFAULT_MAX_FRAME_LEN, Frame, HostEvent, IpcError, read_frame};
use crate::ipc::server::write_frames;
use crate::page::Transport;
use crate::sync::lock;

type Pending = Mutex<HashMap<u64, Sender<Result<Value, String>>>>;

/// Connection to a [`BridgeServer`](crate::ipc::BridgeServer)
///
/// Calls may be issued concurrently; responses are matched to calls by id.
/// Dropping every clone closes the connection, which the host treats as a page
/// unload.
#[derive(Clone)]
pub struct SocketTransport {
    next_id: Arc<AtomicU64>,
    pending: Arc<Pending>,
    outbound: Sender<Frame>,
}

impl SocketTransport {
    /// Connect to a bridge server
    ///
    /// Returns the transport and the stream of events pushed by the host; feed
    /// the latter to [`Page::pump`](crate::Page::pump).
    pub async fn connect<E: Executor + Clone + 'static>(
        socket_path: impl AsRef<Path>,
        executor: E,
    ) -> Result<(Self, Receiver<HostEvent>), IpcError> {
        let stream = UnixStream::connect(socket_path.as_ref()).await?;
        let (outbound, frames) = unbounded();
        let (events_tx, events) = unbounded();
        let pending: Arc<Pending> = Arc::new(Mutex::new(HashMap::new()));

        executor.spawn(write_frames(stream.clone(), frames)).detach();
        executor
            .spawn(read_frames(stream, Arc::clone(&pending), events_tx))
            .detach();

        tracing::debug!(path = %socket_path.as_ref().display(), "connected to bridge");
        let transport = Self {
            next_id: Arc::new(AtomicU64::new(0)),
            pending,
            outbound,
        };
        Ok((transport, events))
    }
}

impl Transport for SocketTransport {
    async fn call(&self, channel: &str, args: Vec<Value>) -> BridgeResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = bounded(1);
        lock(&self.pending).insert(id, reply_tx);

        let request = Frame::Request {
            id,
            channel: channel.to_string(),
            args,
        };
        if self.outbound.send(request).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(BridgeError::Disconnected);
        }

        match reply_rx.recv().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(BridgeError::Rejected(message)),
            Err(_) => Err(BridgeError::Disconnected),
        }
    }
}

async fn read_frames(mut stream: UnixStream, pending: Arc<Pending>, events: Sender<HostEvent>) {
    loop {
        let frame = match read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read host frame");
                break;
            }
        };

        match frame {
            Frame::Response { id, result } => {
                let reply = lock(&pending).remove(&id);
                match reply {
                    Some(reply) => {
                        let _ = reply.try_send(result);
                    }
                    None => tracing::debug!(id, "response for unknown call"),
                }
            }
            Frame::Event(event) => {
                if events.try_send(event).is_err() {
                    tracing::debug!("page stopped listening for host events");
                }
            }
            Frame::Request { .. } => tracing::warn!("host sent a request frame"),
        }
    }

    // Pending calls fail with `Disconnected` once their reply senders drop.
    lock(&pending).clear();
    tracing::debug!("bridge connection closed");
}
