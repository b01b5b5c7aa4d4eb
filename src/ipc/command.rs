//! Named channel trait definition

use std::future::Future;

use serde::{Serialize, de::DeserializeOwned};

use crate::error::BridgeResult;

/// A typed handler reachable through `invoke(channel)` from a page
///
/// The struct is deserialized from the positional call arguments, so a channel
/// called as `invoke("add")(1, 2)` can be declared as:
///
/// ```rust,ignore
/// use serde::Deserialize;
/// use ferry::ipc::Channel;
///
/// #[derive(Deserialize)]
/// struct Add {
///     a: i64,
///     b: i64,
/// }
///
/// impl Channel for Add {
///     type Response = i64;
///
///     fn name(&self) -> String {
///         "add".to_string()
///     }
///
///     async fn handle(&mut self) -> ferry::BridgeResult<i64> {
///         Ok(self.a + self.b)
///     }
/// }
/// ```
pub trait Channel: DeserializeOwned + Send + 'static {
    /// The response type returned to the page
    type Response: Serialize + Send;

    /// Channel name used for dispatch
    fn name(&self) -> String;

    /// Handle one call
    ///
    /// An error rejects the page's pending call with the error message.
    fn handle(&mut self) -> impl Future<Output = BridgeResult<Self::Response>> + Send;
}

/// Answers `"pong"`, handy for checking that a page is wired to a live host
#[derive(Debug, Default, serde::Deserialize)]
pub struct Ping {}

impl Channel for Ping {
    type Response = String;

    fn name(&self) -> String {
        "ping".to_string()
    }

    async fn handle(&mut self) -> BridgeResult<String> {
        Ok("pong".to_string())
    }
}
