//! Ferry - a bridge between sandboxed pages and privileged workers
//!
//! A page running without host privileges asks a privileged host to create
//! background workers, proxy `fetch` requests and run named channels on its
//! behalf. Functions never cross the boundary: they are exported as
//! `{ "type": "function", "beacon": .. }` placeholders and called back by
//! message.
//!
//! - [`Page`] is the sandboxed side: `createWorker`, `fetch`, `invoke` and
//!   `beforeunload`.
//! - [`Host`] is the privileged side, one per page, owning that page's beacon
//!   registry.
//! - [`BridgeServer`] and [`SocketTransport`] connect the two over a Unix
//!   domain socket; `Arc<Host>` is also a [`Transport`] for in-process use.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ferry::{Callback, Host, Page};
//! use serde_json::{Value, json};
//!
//! async fn run() -> ferry::BridgeResult<()> {
//!     let (events_tx, events_rx) = smol::channel::unbounded();
//!     let host = Host::builder().build(events_tx);
//!     let page = Page::new(host);
//!
//!     let worker = page.create_worker("worker.js", Value::Null).await?;
//!     let on_message: Callback = Arc::new(|args| println!("worker said {args:?}"));
//!     worker.add_event_listener("message", &on_message).await?;
//!     worker.post_message(json!("ping")).await?;
//!
//!     page.drain(&events_rx);
//!     page.before_unload().await
//! }
//! ```
//!
//! # Lifetimes across the boundary
//!
//! The host keeps only a weak reference to each forwarding callback. Once a
//! worker lets go of a callback (listener removed, worker terminated) the host
//! finalizes it and sends `StoreDelete`, and the page forgets the function.

mod beacon;
mod config;
mod error;
pub mod host;
pub mod ipc;
mod marshal;
mod page;
mod sync;

pub use beacon::{Beacon, BeaconAllocator};
pub use config::{BridgeConfig, BridgeConfigBuilder};
pub use error::{BridgeError, BridgeResult};
pub use host::{
    BEFORE_UNLOAD_CHANNEL, Diagnostics, EXEC_COMMANDS_CHANNEL, FETCH_CHANNEL, FetchOptions,
    FetchResponse, Host, HostBuilder, NODE_WORKER_CHANNEL, Worker, WorkerAction, WorkerFactory,
    WorkerSource,
};
pub use ipc::{BridgeServer, Channel, ChannelRouter, HostEvent, IpcError, SocketTransport};
pub use marshal::{Arg, Callback, FUNCTION_TAG, placeholder, placeholder_beacon};
pub use page::{Page, PageHooks, Transport, WorkerHandle};
