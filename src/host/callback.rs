//! Forwarding callbacks: privileged stand-ins for page functions

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use smol::channel::Sender;

use crate::beacon::Beacon;
use crate::host::worker::Listener;
use crate::ipc::protocol::{Frame, HostEvent};

/// Outbound channel from the host to one page
///
/// Emission is fire-and-forget: the host never waits for the page to act on an
/// event, and events for a page that has gone away are dropped.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: HostEvent);
}

impl EventSink for Sender<HostEvent> {
    fn emit(&self, event: HostEvent) {
        if self.try_send(event).is_err() {
            tracing::debug!("page event channel closed, dropping event");
        }
    }
}

impl EventSink for Sender<Frame> {
    fn emit(&self, event: HostEvent) {
        if self.try_send(Frame::Event(event)).is_err() {
            tracing::debug!("page connection closed, dropping event");
        }
    }
}

/// Calls a page function by sending `StoreExecute` back across the boundary
///
/// The host registry only keeps a weak reference; whoever holds the callback
/// (usually a worker's listener table) keeps it alive. Dropping the last strong
/// reference queues the beacon for finalization, which ends with a
/// `StoreDelete` notice to the page.
pub struct ForwardingCallback {
    beacon: Beacon,
    sink: Arc<dyn EventSink>,
    finalizer: Sender<Beacon>,
}

impl ForwardingCallback {
    pub(crate) fn new(beacon: Beacon, sink: Arc<dyn EventSink>, finalizer: Sender<Beacon>) -> Self {
        Self {
            beacon,
            sink,
            finalizer,
        }
    }
}

impl Listener for ForwardingCallback {
    fn call(&self, params: Vec<Value>) {
        self.sink.emit(HostEvent::StoreExecute {
            beacon: self.beacon.clone(),
            params,
        });
    }
}

impl fmt::Debug for ForwardingCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingCallback")
            .field("beacon", &self.beacon)
            .finish_non_exhaustive()
    }
}

impl Drop for ForwardingCallback {
    fn drop(&mut self) {
        // Closed queue means the page is already torn down.
        let _ = self.finalizer.try_send(self.beacon.clone());
    }
}
