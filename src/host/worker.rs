//! Privileged workers and the control vocabulary that drives them

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use crate::error::{BridgeError, BridgeResult};
use crate::sync::lock;

/// Something a worker can call back when it emits an event
pub trait Listener: Send + Sync {
    fn call(&self, args: Vec<Value>);
}

/// A background worker running with host privileges
///
/// Implementations must tolerate calls after `terminate` (they become no-ops) and
/// must drop every registered listener once terminated.
pub trait Worker: Send + Sync {
    /// Deliver one message to the worker
    fn post_message(&self, message: Value) -> BridgeResult<()>;

    fn add_event_listener(&self, event: &str, listener: Arc<dyn Listener>);

    fn remove_event_listener(&self, event: &str, listener: &Arc<dyn Listener>);

    /// Stop the worker and release its resources
    fn terminate(&self) -> BridgeResult<()>;
}

/// Instantiates workers from a source URL
pub trait WorkerFactory: Send + Sync {
    /// Start a worker for `url` with constructor `options`
    ///
    /// `url` is either what the page supplied or a base64 `data:` URL built from
    /// a source buffer.
    fn spawn(&self, url: &str, options: &Value) -> BridgeResult<Arc<dyn Worker>>;
}

/// Control actions accepted for a worker beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAction {
    Create,
    PostMessage,
    AddEventListener,
    RemoveEventListener,
    Terminate,
}

impl WorkerAction {
    /// Parse an action name as sent by the page
    ///
    /// Unknown names yield `None`; callers treat those as no-ops so that a newer
    /// page can talk to an older host.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "create" => Some(Self::Create),
            "postMessage" => Some(Self::PostMessage),
            "addEventListener" => Some(Self::AddEventListener),
            "removeEventListener" => Some(Self::RemoveEventListener),
            "terminate" => Some(Self::Terminate),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::PostMessage => "postMessage",
            Self::AddEventListener => "addEventListener",
            Self::RemoveEventListener => "removeEventListener",
            Self::Terminate => "terminate",
        }
    }
}

/// Where a worker's program comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSource {
    /// A URL or path handed to the factory as-is
    Url(String),
    /// Raw program text, shipped as a base64 data URL
    Code(Vec<u8>),
}

impl WorkerSource {
    /// Decode a source argument received from the page
    ///
    /// Accepts a string, an array of bytes, or a serialized buffer of the form
    /// `{ "type": "Buffer", "data": [..] }`.
    pub fn from_value(value: &Value) -> BridgeResult<Self> {
        match value {
            Value::String(url) => Ok(Self::Url(url.clone())),
            Value::Array(items) => bytes_from_array(items).map(Self::Code),
            Value::Object(object) if object.get("type").and_then(Value::as_str) == Some("Buffer") => {
                match object.get("data") {
                    Some(Value::Array(items)) => bytes_from_array(items).map(Self::Code),
                    _ => Err(BridgeError::WorkerCreation(
                        "buffer source without data".to_string(),
                    )),
                }
            }
            other => Err(BridgeError::WorkerCreation(format!(
                "unsupported worker source: {other}"
            ))),
        }
    }

    /// Encode for transmission to the host
    pub fn to_value(&self) -> Value {
        match self {
            Self::Url(url) => Value::String(url.clone()),
            Self::Code(code) => Value::Array(code.iter().map(|b| json!(b)).collect()),
        }
    }

    /// URL the factory should load
    pub fn into_url(self) -> String {
        match self {
            Self::Url(url) => url,
            Self::Code(code) => format!(
                "data:application/javascript;base64,{}",
                STANDARD.encode(code)
            ),
        }
    }
}

impl From<&str> for WorkerSource {
    fn from(url: &str) -> Self {
        Self::Url(url.to_string())
    }
}

impl From<Vec<u8>> for WorkerSource {
    fn from(code: Vec<u8>) -> Self {
        Self::Code(code)
    }
}

fn bytes_from_array(items: &[Value]) -> BridgeResult<Vec<u8>> {
    items
        .iter()
        .map(|item| {
            item.as_u64()
                .and_then(|b| u8::try_from(b).ok())
                .ok_or_else(|| BridgeError::WorkerCreation(format!("invalid source byte: {item}")))
        })
        .collect()
}

/// Event listener table shared by worker implementations
///
/// Registering the same listener twice for one event keeps a single entry, as
/// DOM `addEventListener` does.
#[derive(Default)]
pub struct Listeners {
    table: Mutex<HashMap<String, Vec<Arc<dyn Listener>>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, event: &str, listener: Arc<dyn Listener>) {
        let mut table = lock(&self.table);
        let entries = table.entry(event.to_string()).or_default();
        if !entries.iter().any(|existing| same_listener(existing, &listener)) {
            entries.push(listener);
        }
    }

    /// Remove a listener, returning it so the caller controls when it drops
    pub fn remove(&self, event: &str, listener: &Arc<dyn Listener>) -> Option<Arc<dyn Listener>> {
        let mut table = lock(&self.table);
        let entries = table.get_mut(event)?;
        let index = entries
            .iter()
            .position(|existing| same_listener(existing, listener))?;
        let removed = entries.remove(index);
        if entries.is_empty() {
            table.remove(event);
        }
        Some(removed)
    }

    /// Call every listener for `event` with `{ "type": event, "data": data }`
    ///
    /// Returns the number of listeners called.
    pub fn emit(&self, event: &str, data: Value) -> usize {
        let listeners: Vec<Arc<dyn Listener>> = lock(&self.table)
            .get(event)
            .map(|entries| entries.to_vec())
            .unwrap_or_default();

        let payload = json!({ "type": event, "data": data });
        for listener in &listeners {
            listener.call(vec![payload.clone()]);
        }
        listeners.len()
    }

    /// Drop every listener
    pub fn clear(&self) {
        let table = std::mem::take(&mut *lock(&self.table));
        drop(table);
    }

    pub fn count(&self, event: &str) -> usize {
        lock(&self.table).get(event).map_or(0, Vec::len)
    }
}

fn same_listener(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Mutex<Vec<Vec<Value>>>);

    impl Listener for Recorder {
        fn call(&self, args: Vec<Value>) {
            lock(&self.0).push(args);
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder(Mutex::new(Vec::new())))
    }

    #[test]
    fn test_action_names() {
        for action in [
            WorkerAction::Create,
            WorkerAction::PostMessage,
            WorkerAction::AddEventListener,
            WorkerAction::RemoveEventListener,
            WorkerAction::Terminate,
        ] {
            assert_eq!(WorkerAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(WorkerAction::parse("ref"), None);
        assert_eq!(WorkerAction::parse("PostMessage"), None);
    }

    #[test]
    fn test_code_source_becomes_data_url() {
        let source = WorkerSource::Code(b"postMessage(1)".to_vec());

        assert_eq!(
            source.into_url(),
            "data:application/javascript;base64,cG9zdE1lc3NhZ2UoMSk="
        );
    }

    #[test]
    fn test_url_source_passes_through() {
        let source = WorkerSource::from("file:///opt/worker.js");

        assert_eq!(source.into_url(), "file:///opt/worker.js");
    }

    #[test]
    fn test_source_from_value() {
        assert_eq!(
            WorkerSource::from_value(&json!("worker.js")).unwrap(),
            WorkerSource::Url("worker.js".to_string())
        );
        assert_eq!(
            WorkerSource::from_value(&json!([104, 105])).unwrap(),
            WorkerSource::Code(b"hi".to_vec())
        );
        assert_eq!(
            WorkerSource::from_value(&json!({ "type": "Buffer", "data": [104, 105] })).unwrap(),
            WorkerSource::Code(b"hi".to_vec())
        );
    }

    #[test]
    fn test_source_from_invalid_value() {
        for value in [json!(null), json!([300]), json!([-1]), json!({ "type": "Buffer" })] {
            assert!(matches!(
                WorkerSource::from_value(&value),
                Err(BridgeError::WorkerCreation(_))
            ));
        }
    }

    #[test]
    fn test_code_source_survives_value_encoding() {
        let source = WorkerSource::Code(vec![0, 127, 255]);

        assert_eq!(WorkerSource::from_value(&source.to_value()).unwrap(), source);
    }

    #[test]
    fn test_listeners_deduplicate_and_emit() {
        let listeners = Listeners::new();
        let rec = recorder();
        let listener: Arc<dyn Listener> = rec.clone();

        listeners.add("message", Arc::clone(&listener));
        listeners.add("message", Arc::clone(&listener));
        assert_eq!(listeners.count("message"), 1);

        assert_eq!(listeners.emit("message", json!("hi")), 1);
        assert_eq!(listeners.emit("error", json!("ignored")), 0);

        let calls = lock(&rec.0);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![json!({ "type": "message", "data": "hi" })]);
    }

    #[test]
    fn test_listeners_remove_and_clear_release_references() {
        let listeners = Listeners::new();
        let rec = recorder();
        let listener: Arc<dyn Listener> = rec.clone();

        listeners.add("message", Arc::clone(&listener));
        listeners.add("exit", Arc::clone(&listener));
        assert_eq!(Arc::strong_count(&rec), 4);

        let removed = listeners.remove("message", &listener);
        assert!(removed.is_some());
        drop(removed);
        assert_eq!(Arc::strong_count(&rec), 3);
        assert!(listeners.remove("message", &listener).is_none());

        listeners.clear();
        assert_eq!(Arc::strong_count(&rec), 2);
        assert_eq!(listeners.count("exit"), 0);
    }
}
