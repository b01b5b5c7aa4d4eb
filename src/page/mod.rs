//! Sandboxed side of the bridge
//!
//! A [`Page`] is what page code talks to: `createWorker`, `fetch`,
//! `invoke(channel)` and `beforeunload`. It exports page functions as
//! placeholders, keeps them alive until the host reports them gone, and runs
//! them when the host asks.
//!
//! # Example
//!
//! ```rust,ignore
//! let (events_tx, events_rx) = smol::channel::unbounded();
//! let host = Host::builder().build(events_tx);
//! let page = Page::new(host);
//!
//! let worker = page.create_worker("worker.js", Value::Null).await?;
//! let on_message: Callback = Arc::new(|args| println!("{args:?}"));
//! worker.add_event_listener("message", &on_message).await?;
//! worker.post_message(json!("ping")).await?;
//! page.pump(events_rx).await;
//! ```

mod store;

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use smol::channel::Receiver;

use crate::beacon::{Beacon, BeaconAllocator};
use crate::error::{BridgeError, BridgeResult};
use crate::host::{
    BEFORE_UNLOAD_CHANNEL, FETCH_CHANNEL, FetchOptions, FetchResponse, Host, NODE_WORKER_CHANNEL,
    WorkerAction, WorkerSource,
};
use crate::ipc::protocol::HostEvent;
use crate::marshal::{Arg, Callback, placeholder};
use crate::sync::lock;

use store::Store;

/// Carries page calls to the host and brings back the result
pub trait Transport: Send + Sync + 'static {
    fn call(
        &self,
        channel: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = BridgeResult<Value>> + Send;
}

/// In-process transport straight into a host
impl Transport for Arc<Host> {
    async fn call(&self, channel: &str, args: Vec<Value>) -> BridgeResult<Value> {
        self.dispatch(channel, args).await
    }
}

/// Embedder reactions to `Refresh` and `ToggleDevTools`
pub trait PageHooks: Send + Sync {
    fn refresh(&self) {}

    fn toggle_dev_tools(&self) {}
}

struct PageInner<T> {
    transport: T,
    store: Mutex<Store>,
    beacons: BeaconAllocator,
    hooks: Option<Box<dyn PageHooks>>,
}

/// The page's handle on the bridge; cheap to clone
pub struct Page<T: Transport> {
    inner: Arc<PageInner<T>>,
}

impl<T: Transport> Clone for Page<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Page<T> {
    pub fn new(transport: T) -> Self {
        Self::build(transport, None)
    }

    pub fn with_hooks(transport: T, hooks: impl PageHooks + 'static) -> Self {
        Self::build(transport, Some(Box::new(hooks)))
    }

    fn build(transport: T, hooks: Option<Box<dyn PageHooks>>) -> Self {
        Self {
            inner: Arc::new(PageInner {
                transport,
                store: Mutex::new(Store::new()),
                beacons: BeaconAllocator::new(),
                hooks,
            }),
        }
    }

    /// Turn an argument into something that can cross the bridge
    ///
    /// Plain values pass through untouched. Functions are exported under a
    /// beacon; exporting the same function again yields the same placeholder.
    pub fn marshal(&self, arg: Arg) -> Value {
        match arg {
            Arg::Value(value) => value,
            Arg::Function(callback) => {
                let beacon = lock(&self.inner.store).export(&callback, &self.inner.beacons);
                placeholder(&beacon)
            }
        }
    }

    /// Call a named channel on the host
    pub async fn invoke(&self, channel: &str, args: Vec<Arg>) -> BridgeResult<Value> {
        let args = args.into_iter().map(|arg| self.marshal(arg)).collect();
        self.inner.transport.call(channel, args).await
    }

    /// Start a worker on the host
    ///
    /// Rejects when the host cannot instantiate the worker; nothing is left
    /// registered on either side in that case.
    pub async fn create_worker(
        &self,
        source: impl Into<WorkerSource>,
        options: Value,
    ) -> BridgeResult<WorkerHandle<T>> {
        let beacon = self.inner.beacons.allocate();
        lock(&self.inner.store).insert_worker(beacon.clone());

        let source = source.into();
        let args = vec![
            json!(beacon),
            json!(WorkerAction::Create.as_str()),
            source.to_value(),
            options,
        ];
        if let Err(e) = self.inner.transport.call(NODE_WORKER_CHANNEL, args).await {
            lock(&self.inner.store).delete(&beacon);
            return Err(e);
        }

        tracing::debug!(beacon = %beacon, "worker handle created");
        Ok(WorkerHandle {
            page: self.clone(),
            beacon,
        })
    }

    /// `fetch` through the host, outside the page's own network rules
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> BridgeResult<FetchResponse> {
        let options = serde_json::to_value(options)?;
        let response = self
            .inner
            .transport
            .call(FETCH_CHANNEL, vec![json!(url), options])
            .await?;
        serde_json::from_value(response).map_err(|e| BridgeError::Fetch(e.to_string()))
    }

    /// Tell the host to release everything this page owns, then forget it locally
    pub async fn before_unload(&self) -> BridgeResult<()> {
        let beacons = lock(&self.inner.store).beacons();
        let result = self
            .inner
            .transport
            .call(BEFORE_UNLOAD_CHANNEL, vec![json!({ "beacons": beacons })])
            .await;

        let released = lock(&self.inner.store).clear();
        tracing::debug!(released = released.len(), "page store cleared");
        result.map(drop)
    }

    /// React to one event pushed by the host
    pub fn handle_event(&self, event: HostEvent) {
        tracing::trace!(event = event.name(), "host event");
        match event {
            HostEvent::StoreDelete { beacon } => {
                lock(&self.inner.store).delete(&beacon);
            }
            HostEvent::StoreExecute { beacon, params } => {
                let callback = lock(&self.inner.store).function(&beacon);
                match callback {
                    Some(callback) => callback(params),
                    None => tracing::debug!(beacon = %beacon, "no page function for StoreExecute"),
                }
            }
            HostEvent::Refresh => {
                if let Some(hooks) = &self.inner.hooks {
                    hooks.refresh();
                }
            }
            HostEvent::ToggleDevTools => {
                if let Some(hooks) = &self.inner.hooks {
                    hooks.toggle_dev_tools();
                }
            }
        }
    }

    /// Handle every event already queued, returning how many there were
    pub fn drain(&self, events: &Receiver<HostEvent>) -> usize {
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Handle events until the host side of `events` closes
    pub async fn pump(&self, events: Receiver<HostEvent>) {
        while let Ok(event) = events.recv().await {
            self.handle_event(event);
        }
    }

    /// Beacon a function is exported under, if any
    pub fn exported(&self, callback: &Callback) -> Option<Beacon> {
        lock(&self.inner.store).exported(callback)
    }

    /// Whether this page still holds `beacon`
    pub fn owns(&self, beacon: &Beacon) -> bool {
        lock(&self.inner.store).contains(beacon)
    }

    /// Number of beacons this page holds
    pub fn owned(&self) -> usize {
        lock(&self.inner.store).len()
    }

    async fn control(&self, beacon: &Beacon, action: WorkerAction, args: Vec<Arg>) -> BridgeResult<()> {
        let mut call = vec![json!(beacon), json!(action.as_str())];
        call.extend(args.into_iter().map(|arg| self.marshal(arg)));
        self.inner.transport.call(NODE_WORKER_CHANNEL, call).await?;
        Ok(())
    }
}

/// Page-side proxy for a worker running on the host
///
/// Every method is a control message; calls after `terminate` reach the host as
/// messages for an unknown beacon and do nothing.
pub struct WorkerHandle<T: Transport> {
    page: Page<T>,
    beacon: Beacon,
}

impl<T: Transport> WorkerHandle<T> {
    pub fn beacon(&self) -> &Beacon {
        &self.beacon
    }

    pub async fn post_message(&self, message: Value) -> BridgeResult<()> {
        self.page
            .control(&self.beacon, WorkerAction::PostMessage, vec![Arg::Value(message)])
            .await
    }

    pub async fn add_event_listener(&self, event: &str, listener: &Callback) -> BridgeResult<()> {
        self.page
            .control(
                &self.beacon,
                WorkerAction::AddEventListener,
                vec![Arg::from(event), Arg::Function(Arc::clone(listener))],
            )
            .await
    }

    pub async fn remove_event_listener(&self, event: &str, listener: &Callback) -> BridgeResult<()> {
        self.page
            .control(
                &self.beacon,
                WorkerAction::RemoveEventListener,
                vec![Arg::from(event), Arg::Function(Arc::clone(listener))],
            )
            .await
    }

    /// Stop the worker; repeated calls are no-ops
    pub async fn terminate(&self) -> BridgeResult<()> {
        let result = self
            .page
            .control(&self.beacon, WorkerAction::Terminate, Vec::new())
            .await;
        lock(&self.page.inner.store).delete(&self.beacon);
        result
    }
}
