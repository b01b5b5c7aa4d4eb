//! Router for named channels

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use crate::error::{BridgeError, BridgeResult};
use crate::ipc::command::{Channel, Ping};

/// Type-erased handler function
type ErasedHandler =
    Box<dyn Fn(Vec<Value>) -> Pin<Box<dyn Future<Output = BridgeResult<Value>> + Send>> + Send + Sync>;

/// Router that dispatches `invoke(channel)` calls to registered handlers
///
/// The router stores type-erased handlers internally, but registration is type-safe
/// via the `Channel` trait. The built-in bridge channels (`fetch`, `execCommands`,
/// `beforeunload`, `NodeWorker`) are served by the host itself and never reach
/// the router.
pub struct ChannelRouter {
    handlers: HashMap<String, ErasedHandler>,
}

impl ChannelRouter {
    /// Create a router with only the `ping` channel
    pub fn new() -> Self {
        Self::empty().register(Ping::default())
    }

    /// Create a router with no channels at all
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a channel
    ///
    /// The channel name comes from `channel.name()`; the instance itself is only
    /// used to get the name and infer the type.
    pub fn register<C: Channel>(mut self, channel: C) -> Self {
        let name = channel.name();

        let handler: ErasedHandler = Box::new(|args: Vec<Value>| {
            Box::pin(async move {
                let mut channel: C = serde_json::from_value(Value::Array(args))?;
                let response = channel.handle().await?;
                Ok(serde_json::to_value(response)?)
            })
        });

        self.handlers.insert(name, handler);
        self
    }

    /// Handle an incoming call
    pub(crate) async fn handle(&self, channel: &str, args: Vec<Value>) -> BridgeResult<Value> {
        let handler = self
            .handlers
            .get(channel)
            .ok_or_else(|| BridgeError::UnknownChannel(channel.to_string()))?;

        handler(args).await
    }

    /// Names of the registered channels
    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}
