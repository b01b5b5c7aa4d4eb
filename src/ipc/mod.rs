//! Transport between a page and the privileged host
//!
//! Pages talk to the host over a Unix domain socket using length-prefixed
//! MessagePack frames. The host side is a [`BridgeServer`]; the page side is a
//! [`SocketTransport`] plugged into a [`Page`](crate::Page).
//!
//! Extra channels reachable through `invoke` are typed [`Channel`]s registered on
//! a [`ChannelRouter`]:
//!
//! ```rust,ignore
//! use serde::Deserialize;
//! use ferry::ipc::{Channel, ChannelRouter};
//!
//! #[derive(Deserialize)]
//! struct Version {}
//!
//! impl Channel for Version {
//!     type Response = String;
//!
//!     fn name(&self) -> String { "version".to_string() }
//!
//!     async fn handle(&mut self) -> ferry::BridgeResult<String> {
//!         Ok(env!("CARGO_PKG_VERSION").to_string())
//!     }
//! }
//!
//! let router = ChannelRouter::new().register(Version {});
//! let hosts = HostBuilder::new().router(router);
//! let server = BridgeServer::new(hosts, "/tmp/ferry.sock", executor).await?;
//! ```

mod client;
mod command;
pub(crate) mod protocol;
pub(crate) mod router;
mod server;

pub use client::SocketTransport;
pub use command::{Channel, Ping};
pub use protocol::{DEFAULT_MAX_FRAME_LEN, Frame, HostEvent, IpcError, read_frame, write_frame};
pub use router::ChannelRouter;
pub use server::BridgeServer;

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use executor_core::tokio::TokioGlobal;
    use serde_json::{Value, json};

    use super::*;
    use crate::host::HostBuilder;
    use crate::host::testing::MemoryFactory;
    use crate::marshal::Callback;
    use crate::page::Page;
    use crate::{BridgeError, WorkerSource};

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn serve(factory: MemoryFactory) -> (tempfile::TempDir, BridgeServer) {
        let dir = tempfile::tempdir().unwrap();
        let hosts = HostBuilder::new().worker_factory(factory);
        let server = BridgeServer::new(hosts, dir.path().join("bridge.sock"), TokioGlobal)
            .await
            .unwrap();
        (dir, server)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invoke_over_socket() {
        let (_dir, server) = serve(MemoryFactory::default()).await;
        let (transport, _events) = SocketTransport::connect(server.socket_path(), TokioGlobal)
            .await
            .unwrap();
        let page = Page::new(transport);

        assert_eq!(page.invoke("ping", Vec::new()).await.unwrap(), json!("pong"));
        match page.invoke("nope", Vec::new()).await {
            Err(BridgeError::Rejected(message)) => assert!(message.contains("nope")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_events_cross_the_socket() {
        let factory = MemoryFactory::default();
        let (_dir, server) = serve(factory.clone()).await;
        let (transport, events) = SocketTransport::connect(server.socket_path(), TokioGlobal)
            .await
            .unwrap();
        let page = Page::new(transport);
        let pump = tokio::spawn({
            let page = page.clone();
            async move { page.pump(events).await }
        });

        let received = Arc::new(std::sync::Mutex::new(Vec::<Value>::new()));
        let sink = Arc::clone(&received);
        let on_message: Callback = Arc::new(move |args: Vec<Value>| sink.lock().unwrap().extend(args));

        let worker = page
            .create_worker(WorkerSource::from("memory:"), Value::Null)
            .await
            .unwrap();
        worker.add_event_listener("message", &on_message).await.unwrap();
        worker.post_message(json!("ping")).await.unwrap();

        wait_until(|| !received.lock().unwrap().is_empty()).await;
        assert_eq!(
            *received.lock().unwrap(),
            vec![json!({ "type": "message", "data": "ping" })]
        );

        let beacon = page.exported(&on_message).unwrap();
        worker.terminate().await.unwrap();
        wait_until(|| !page.owns(&beacon)).await;
        assert_eq!(page.owned(), 0);

        drop(page);
        pump.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disconnect_tears_down_page() {
        let factory = MemoryFactory::default();
        let (_dir, server) = serve(factory.clone()).await;
        let (transport, _events) = SocketTransport::connect(server.socket_path(), TokioGlobal)
            .await
            .unwrap();
        let page = Page::new(transport);
        page.create_worker("memory:", Value::Null).await.unwrap();
        assert_eq!(server.pages(), 1);

        drop(page);

        let worker = factory.worker(0);
        wait_until(|| server.pages() == 0).await;
        assert!(worker.terminated.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broadcast_reaches_connected_pages() {
        let (_dir, server) = serve(MemoryFactory::default()).await;
        let (transport, events) = SocketTransport::connect(server.socket_path(), TokioGlobal)
            .await
            .unwrap();
        let page = Page::new(transport);
        page.invoke("ping", Vec::new()).await.unwrap();

        assert_eq!(server.broadcast(HostEvent::Refresh), 1);
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, HostEvent::Refresh);
    }
}
