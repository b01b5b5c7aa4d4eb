//! Privileged side of the bridge
//!
//! A [`Host`] serves exactly one page. It owns that page's beacon registry, turns
//! function placeholders into forwarding callbacks, drives workers through the
//! control protocol, and tears everything down when the page unloads or its
//! transport goes away.
//!
//! Inbound channels handled here: `fetch`, `execCommands`, `beforeunload` and
//! `NodeWorker`. Any other channel name is routed through the [`ChannelRouter`].

mod callback;
mod exec;
mod fetch;
mod process;
mod registry;
#[cfg(test)]
pub(crate) mod testing;
mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;
use smol::channel::{Receiver, Sender, unbounded};

use crate::beacon::Beacon;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::ipc::protocol::HostEvent;
use crate::ipc::router::ChannelRouter;
use crate::marshal::placeholder_beacon;
use crate::sync::lock;

pub use callback::{EventSink, ForwardingCallback};
pub use exec::{CommandList, ExecOptions, exec_commands};
pub use fetch::{FetchOptions, FetchResponse, fetch};
pub use process::{ProcessWorker, ProcessWorkerFactory};
pub use worker::{Listener, Listeners, Worker, WorkerAction, WorkerFactory, WorkerSource};

use registry::{Entry, Registry};

/// Channel proxying HTTP(S) requests
pub const FETCH_CHANNEL: &str = "fetch";
/// Channel running shell commands on the host
pub const EXEC_COMMANDS_CHANNEL: &str = "execCommands";
/// Channel carrying the bulk teardown notice
pub const BEFORE_UNLOAD_CHANNEL: &str = "beforeunload";
/// Channel carrying worker control messages `(beacon, action, ...args)`
pub const NODE_WORKER_CHANNEL: &str = "NodeWorker";

/// Counters for protocol inconsistencies that are recovered silently
#[derive(Debug, Default)]
pub struct Diagnostics {
    unknown_beacons: AtomicU64,
    unknown_actions: AtomicU64,
    finalized_callbacks: AtomicU64,
}

impl Diagnostics {
    /// Control messages that named a beacon with no live worker
    pub fn unknown_beacons(&self) -> u64 {
        self.unknown_beacons.load(Ordering::Relaxed)
    }

    /// Control messages with an action name this host does not know
    pub fn unknown_actions(&self) -> u64 {
        self.unknown_actions.load(Ordering::Relaxed)
    }

    /// Forwarding callbacks dropped and reported back with `StoreDelete`
    pub fn finalized_callbacks(&self) -> u64 {
        self.finalized_callbacks.load(Ordering::Relaxed)
    }
}

/// A control argument after placeholder resolution
enum Resolved {
    Value(Value),
    Callback(Arc<ForwardingCallback>),
    Worker,
}

impl Resolved {
    /// The plain value, or a marshaling error naming `what` for live objects
    fn into_value(self, what: &str) -> BridgeResult<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Callback(_) | Self::Worker => {
                Err(BridgeError::Marshal(format!("{what} cannot be a function or worker")))
            }
        }
    }
}

/// Builds hosts that share configuration, channels and a worker factory
///
/// One builder typically lives for the whole process; each connecting page gets
/// its own [`Host`] from [`HostBuilder::build`].
#[derive(Clone)]
pub struct HostBuilder {
    config: Arc<BridgeConfig>,
    router: Arc<ChannelRouter>,
    factory: Option<Arc<dyn WorkerFactory>>,
}

impl HostBuilder {
    pub fn new() -> Self {
        Self {
            config: Arc::new(BridgeConfig::default()),
            router: Arc::new(ChannelRouter::new()),
            factory: None,
        }
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Channels served behind `invoke`
    pub fn router(mut self, router: ChannelRouter) -> Self {
        self.router = Arc::new(router);
        self
    }

    /// Replace the default process-backed worker factory
    pub fn worker_factory(mut self, factory: impl WorkerFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    pub fn bridge_config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Create the host for one page, pushing its events into `sink`
    pub fn build(&self, sink: impl EventSink) -> Arc<Host> {
        let factory = match &self.factory {
            Some(factory) => Arc::clone(factory),
            None => Arc::new(ProcessWorkerFactory::new(Arc::clone(&self.config))),
        };
        let (finalizer_tx, finalizer_rx) = unbounded();

        Arc::new(Host {
            config: Arc::clone(&self.config),
            router: Arc::clone(&self.router),
            factory,
            sink: Arc::new(sink),
            registry: Mutex::new(Registry::new()),
            finalizer_tx,
            finalizer_rx,
            diagnostics: Diagnostics::default(),
        })
    }
}

impl Default for HostBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Privileged endpoint for a single page
pub struct Host {
    config: Arc<BridgeConfig>,
    router: Arc<ChannelRouter>,
    factory: Arc<dyn WorkerFactory>,
    sink: Arc<dyn EventSink>,
    registry: Mutex<Registry>,
    finalizer_tx: Sender<Beacon>,
    finalizer_rx: Receiver<Beacon>,
    diagnostics: Diagnostics,
}

impl Host {
    pub fn builder() -> HostBuilder {
        HostBuilder::new()
    }

    /// Handle one inbound call from the page
    ///
    /// Callbacks released while handling the call are finalized before returning,
    /// so any `StoreDelete` they cause is queued ahead of later events.
    pub async fn dispatch(&self, channel: &str, args: Vec<Value>) -> BridgeResult<Value> {
        tracing::debug!(channel = %channel, args = args.len(), "dispatching page call");

        let result = match channel {
            FETCH_CHANNEL => self.fetch(args).await,
            EXEC_COMMANDS_CHANNEL => self.exec_commands(args).await,
            BEFORE_UNLOAD_CHANNEL => self.before_unload(args).await,
            NODE_WORKER_CHANNEL => self.node_worker(args).await,
            _ => self.router.handle(channel, args).await,
        };

        self.collect_finalized();
        result
    }

    /// Push `Refresh` or `ToggleDevTools` (or any other event) to the page
    pub fn emit(&self, event: HostEvent) {
        self.sink.emit(event);
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Whether `beacon` currently names a live registry entry
    pub fn is_registered(&self, beacon: &Beacon) -> bool {
        lock(&self.registry).contains(beacon)
    }

    /// Number of registry entries, live or awaiting finalization
    pub fn registered(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Release every beacon this page still holds
    ///
    /// Used when the transport closes without a `beforeunload` notice.
    pub fn teardown(&self) -> usize {
        let beacons = lock(&self.registry).beacons();
        let released = terminate_all(self.take_entries(beacons));
        self.collect_finalized();
        tracing::debug!(released, "page torn down");
        released
    }

    /// Finalize every callback dropped so far without waiting
    pub fn collect_finalized(&self) -> usize {
        let mut finalized = 0;
        while let Ok(beacon) = self.finalizer_rx.try_recv() {
            if self.finalize(beacon) {
                finalized += 1;
            }
        }
        finalized
    }

    /// Finalize callbacks as they are dropped, for as long as the host lives
    ///
    /// Workers drop listeners on their own threads, so a connection runs this
    /// next to its request loop.
    pub async fn run_finalizers(&self) {
        while let Ok(beacon) = self.finalizer_rx.recv().await {
            self.finalize(beacon);
        }
    }

    fn finalize(&self, beacon: Beacon) -> bool {
        if !lock(&self.registry).remove_dead_callback(&beacon) {
            return false;
        }

        self.diagnostics
            .finalized_callbacks
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(beacon = %beacon, "forwarding callback finalized");
        self.sink.emit(HostEvent::StoreDelete { beacon });
        true
    }

    async fn fetch(&self, args: Vec<Value>) -> BridgeResult<Value> {
        let mut args = args.into_iter();
        let url = match args.next() {
            Some(Value::String(url)) => url,
            _ => return Err(BridgeError::Fetch("fetch requires a URL string".to_string())),
        };
        let options: FetchOptions = decode_or_default(args.next())?;

        let response = fetch(&url, options, Arc::clone(&self.config)).await?;
        Ok(serde_json::to_value(response)?)
    }

    async fn exec_commands(&self, args: Vec<Value>) -> BridgeResult<Value> {
        let mut args = args.into_iter();
        let commands: CommandList = serde_json::from_value(args.next().unwrap_or(Value::Null))?;
        let options: ExecOptions = decode_or_default(args.next())?;

        exec_commands(commands, options, Arc::clone(&self.config)).await
    }

    /// Accepts `{ "beacons": [..] }` or a bare list of beacons
    async fn before_unload(&self, args: Vec<Value>) -> BridgeResult<Value> {
        let list = match args.into_iter().next() {
            Some(Value::Object(mut object)) => object.remove("beacons").unwrap_or(Value::Null),
            Some(other) => other,
            None => Value::Null,
        };
        let beacons = match list {
            Value::Array(items) => items.iter().filter_map(beacon_from_value).collect(),
            Value::Null => Vec::new(),
            other => {
                return Err(BridgeError::Marshal(format!(
                    "beforeunload expects a list of beacons, got {other}"
                )));
            }
        };

        let removed = self.take_entries(beacons);
        let released = blocking::unblock(move || terminate_all(removed)).await;
        tracing::info!(released, "page unloading");
        Ok(Value::Null)
    }

    /// Remove every listed beacon that names an entry
    fn take_entries(&self, beacons: Vec<Beacon>) -> Vec<(Beacon, Entry)> {
        let mut registry = lock(&self.registry);
        beacons
            .into_iter()
            .filter_map(|beacon| registry.remove(&beacon).map(|entry| (beacon, entry)))
            .collect()
    }

    /// Apply one control message `(beacon, action, ...args)`
    ///
    /// Arguments are unmarshaled before the worker is looked up, so a callback
    /// sent to a missing worker is still finalized and the page told to forget it.
    async fn node_worker(&self, args: Vec<Value>) -> BridgeResult<Value> {
        let mut args = args.into_iter();
        let beacon = args
            .next()
            .as_ref()
            .and_then(beacon_from_value)
            .ok_or_else(|| BridgeError::Marshal("worker control message without beacon".to_string()))?;
        let name = args.next();
        let resolved: Vec<Resolved> = args.map(|arg| self.unmarshal(arg)).collect();
        let mut args = resolved.into_iter();
        let mut next = || args.next().unwrap_or(Resolved::Value(Value::Null));

        let Some(action) = name.as_ref().and_then(Value::as_str).and_then(WorkerAction::parse) else {
            self.diagnostics.unknown_actions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(beacon = %beacon, action = ?name, "ignoring unknown worker action");
            return Ok(Value::Null);
        };

        match action {
            WorkerAction::Create => {
                let source = WorkerSource::from_value(&next().into_value("worker source")?)?;
                let options = next().into_value("worker options")?;
                self.create_worker(beacon, source, options).await?;
            }
            WorkerAction::PostMessage => {
                let Some(worker) = self.live_worker(&beacon, action) else {
                    return Ok(Value::Null);
                };
                let message = next().into_value("a posted message")?;
                blocking::unblock(move || worker.post_message(message)).await?;
            }
            WorkerAction::AddEventListener => {
                let Some(worker) = self.live_worker(&beacon, action) else {
                    return Ok(Value::Null);
                };
                let event = event_name(next().into_value("event name")?)?;
                let listener = next();
                match listener {
                    Resolved::Callback(callback) => worker.add_event_listener(&event, callback),
                    Resolved::Value(value) => {
                        tracing::debug!(beacon = %beacon, event = %event, listener = %value, "ignoring non-function listener");
                    }
                    Resolved::Worker => {
                        tracing::debug!(beacon = %beacon, event = %event, "ignoring worker passed as listener");
                    }
                }
            }
            WorkerAction::RemoveEventListener => {
                let Some(worker) = self.live_worker(&beacon, action) else {
                    return Ok(Value::Null);
                };
                let event = event_name(next().into_value("event name")?)?;
                let listener = next();
                if let Resolved::Callback(callback) = listener {
                    let callback: Arc<dyn Listener> = callback;
                    worker.remove_event_listener(&event, &callback);
                }
            }
            WorkerAction::Terminate => {
                let entry = {
                    let mut registry = lock(&self.registry);
                    match registry.worker(&beacon) {
                        Some(_) => registry.remove(&beacon),
                        None => None,
                    }
                };
                match entry {
                    Some(Entry::Worker(worker)) => {
                        blocking::unblock(move || worker.terminate()).await?;
                        tracing::info!(beacon = %beacon, "worker terminated");
                    }
                    _ => self.note_unknown_beacon(&beacon, action),
                }
            }
        }

        Ok(Value::Null)
    }

    fn live_worker(&self, beacon: &Beacon, action: WorkerAction) -> Option<Arc<dyn Worker>> {
        let worker = lock(&self.registry).worker(beacon);
        if worker.is_none() {
            self.note_unknown_beacon(beacon, action);
        }
        worker
    }

    fn note_unknown_beacon(&self, beacon: &Beacon, action: WorkerAction) {
        self.diagnostics.unknown_beacons.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(beacon = %beacon, action = action.as_str(), "ignoring control message for unknown worker");
    }

    async fn create_worker(&self, beacon: Beacon, source: WorkerSource, options: Value) -> BridgeResult<()> {
        if self.is_registered(&beacon) {
            return Err(BridgeError::WorkerCreation(format!("beacon {beacon} is already in use")));
        }

        let factory = Arc::clone(&self.factory);
        let url = source.into_url();
        let worker = blocking::unblock(move || factory.spawn(&url, &options)).await?;
        if !lock(&self.registry).insert_worker(beacon.clone(), Arc::clone(&worker)) {
            let _ = blocking::unblock(move || worker.terminate()).await;
            return Err(BridgeError::WorkerCreation(format!("beacon {beacon} is already in use")));
        }

        tracing::info!(beacon = %beacon, "worker created");
        Ok(())
    }

    /// Resolve a marshaled argument into a live object
    ///
    /// Placeholders naming a live entry resolve to that entry. Any other
    /// placeholder gets a fresh forwarding callback, registered weakly.
    fn unmarshal(&self, value: Value) -> Resolved {
        let Some(beacon) = placeholder_beacon(&value) else {
            return Resolved::Value(value);
        };

        let mut registry = lock(&self.registry);
        match registry.get(&beacon) {
            Some(Entry::Worker(_)) => return Resolved::Worker,
            Some(Entry::Callback(weak)) => {
                if let Some(callback) = weak.upgrade() {
                    return Resolved::Callback(callback);
                }
            }
            None => {}
        }

        let callback = Arc::new(ForwardingCallback::new(
            beacon.clone(),
            Arc::clone(&self.sink),
            self.finalizer_tx.clone(),
        ));
        registry.insert_callback(beacon, &callback);
        Resolved::Callback(callback)
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        let beacons = lock(&self.registry).beacons();
        if !beacons.is_empty() {
            terminate_all(self.take_entries(beacons));
        }
    }
}

fn beacon_from_value(value: &Value) -> Option<Beacon> {
    match value {
        Value::String(id) => Some(Beacon::new(id.as_str())),
        Value::Number(id) => Some(Beacon::new(id.to_string())),
        _ => None,
    }
}

/// Terminate the workers among released entries; entries stay released even
/// when `terminate` fails
fn terminate_all(removed: Vec<(Beacon, Entry)>) -> usize {
    let released = removed.len();
    for (beacon, entry) in removed {
        if let Entry::Worker(worker) = entry
            && let Err(e) = worker.terminate()
        {
            tracing::warn!(beacon = %beacon, error = %e, "worker failed to terminate during teardown");
        }
    }
    released
}

fn event_name(value: Value) -> BridgeResult<String> {
    match value {
        Value::String(event) => Ok(event),
        other => Err(BridgeError::Marshal(format!(
            "event name must be a string, got {other}"
        ))),
    }
}

fn decode_or_default<T: DeserializeOwned + Default>(value: Option<Value>) -> BridgeResult<T> {
    match value {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => Ok(serde_json::from_value(value)?),
    }
}
