//! In-memory workers for exercising the host without spawning processes

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::host::worker::{Listener, Listeners, Worker, WorkerFactory};
use crate::sync::lock;

/// Records every message and echoes it back as a `message` event
pub(crate) struct MemoryWorker {
    pub url: String,
    pub options: Value,
    pub received: Mutex<Vec<Value>>,
    pub listeners: Listeners,
    pub terminated: AtomicBool,
    pub terminate_calls: AtomicUsize,
    pub fail_terminate: bool,
}

impl MemoryWorker {
    pub fn new() -> Arc<Self> {
        Self::with_url("memory:", Value::Null, false)
    }

    fn with_url(url: &str, options: Value, fail_terminate: bool) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            options,
            received: Mutex::new(Vec::new()),
            listeners: Listeners::new(),
            terminated: AtomicBool::new(false),
            terminate_calls: AtomicUsize::new(0),
            fail_terminate,
        })
    }

    pub fn received(&self) -> Vec<Value> {
        lock(&self.received).clone()
    }

    /// Emit an event as if the worker produced it
    pub fn emit(&self, event: &str, data: Value) -> usize {
        self.listeners.emit(event, data)
    }
}

impl Worker for MemoryWorker {
    fn post_message(&self, message: Value) -> BridgeResult<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(());
        }
        lock(&self.received).push(message.clone());
        self.listeners.emit("message", message);
        Ok(())
    }

    fn add_event_listener(&self, event: &str, listener: Arc<dyn Listener>) {
        self.listeners.add(event, listener);
    }

    fn remove_event_listener(&self, event: &str, listener: &Arc<dyn Listener>) {
        self.listeners.remove(event, listener);
    }

    fn terminate(&self) -> BridgeResult<()> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        self.terminated.store(true, Ordering::SeqCst);
        self.listeners.clear();
        if self.fail_terminate {
            return Err(BridgeError::Worker("terminate failed".to_string()));
        }
        Ok(())
    }
}

/// Factory handing out `MemoryWorker`s and remembering them
///
/// URLs starting with `bad:` fail to start; URLs starting with `stuck:` produce
/// workers whose `terminate` fails.
#[derive(Default, Clone)]
pub(crate) struct MemoryFactory {
    pub workers: Arc<Mutex<Vec<Arc<MemoryWorker>>>>,
}

impl MemoryFactory {
    pub fn worker(&self, index: usize) -> Arc<MemoryWorker> {
        Arc::clone(&lock(&self.workers)[index])
    }

    pub fn spawned(&self) -> usize {
        lock(&self.workers).len()
    }
}

impl WorkerFactory for MemoryFactory {
    fn spawn(&self, url: &str, options: &Value) -> BridgeResult<Arc<dyn Worker>> {
        if url.starts_with("bad:") {
            return Err(BridgeError::WorkerCreation(format!("cannot load {url}")));
        }
        let worker = MemoryWorker::with_url(url, options.clone(), url.starts_with("stuck:"));
        lock(&self.workers).push(Arc::clone(&worker));
        Ok(worker)
    }
}
