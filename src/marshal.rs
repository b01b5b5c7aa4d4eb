//! Values as they cross the trust boundary
//!
//! Plain data travels as JSON. A function cannot travel at all, so the side that
//! owns it registers it under a beacon and sends a placeholder instead:
//!
//! ```text
//! { "type": "function", "beacon": "<beacon>" }
//! ```
//!
//! The receiving side turns the placeholder back into something callable that
//! routes invocations to the owner by message.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::beacon::Beacon;
use crate::error::{BridgeError, BridgeResult};

/// `type` tag carried by function placeholders
pub const FUNCTION_TAG: &str = "function";

/// A function living on the sandboxed side, callable with positional arguments
pub type Callback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Build the placeholder that stands in for a function registered under `beacon`
pub fn placeholder(beacon: &Beacon) -> Value {
    let mut map = Map::new();
    map.insert("type".to_string(), Value::String(FUNCTION_TAG.to_string()));
    map.insert("beacon".to_string(), Value::String(beacon.as_str().to_string()));
    Value::Object(map)
}

/// Extract the beacon from a function placeholder
///
/// Returns `None` for anything that is not a placeholder: non-objects, objects
/// whose `type` is not `"function"`, or objects without a usable `beacon`.
pub fn placeholder_beacon(value: &Value) -> Option<Beacon> {
    let object = value.as_object()?;
    if object.get("type")?.as_str()? != FUNCTION_TAG {
        return None;
    }

    match object.get("beacon")? {
        Value::String(id) => Some(Beacon::new(id.as_str())),
        Value::Number(id) => Some(Beacon::new(id.to_string())),
        _ => None,
    }
}

/// Identity of a callback, stable for as long as the callback is alive
pub(crate) fn callback_identity(callback: &Callback) -> usize {
    Arc::as_ptr(callback) as *const () as usize
}

/// An argument handed to the bridge by page code
#[derive(Clone)]
pub enum Arg {
    /// Plain data, passed by value
    Value(Value),
    /// A function, passed by beacon
    Function(Callback),
}

impl Arg {
    /// Wrap a closure as a function argument
    pub fn function(f: impl Fn(Vec<Value>) + Send + Sync + 'static) -> Self {
        Self::Function(Arc::new(f))
    }

    /// Serialize any value into a plain argument
    ///
    /// Fails when the value has no JSON representation (for example a map with
    /// non-string keys).
    pub fn value<T: Serialize + ?Sized>(value: &T) -> BridgeResult<Self> {
        serde_json::to_value(value)
            .map(Self::Value)
            .map_err(|e| BridgeError::Marshal(e.to_string()))
    }
}

impl fmt::Debug for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Function(callback) => f
                .debug_tuple("Function")
                .field(&format_args!("{:#x}", callback_identity(callback)))
                .finish(),
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Callback> for Arg {
    fn from(callback: Callback) -> Self {
        Self::Function(callback)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Self::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_placeholder_roundtrip() {
        let beacon = Beacon::from("p/3");
        let value = placeholder(&beacon);

        assert_eq!(value, json!({ "type": "function", "beacon": "p/3" }));
        assert_eq!(placeholder_beacon(&value), Some(beacon));
    }

    #[test]
    fn test_plain_values_are_not_placeholders() {
        for value in [
            json!(null),
            json!("function"),
            json!(42),
            json!([1, 2, 3]),
            json!({ "type": "function" }),
            json!({ "beacon": "p/1" }),
            json!({ "type": "object", "beacon": "p/1" }),
            json!({ "type": "function", "beacon": null }),
        ] {
            assert_eq!(placeholder_beacon(&value), None, "{value}");
        }
    }

    #[test]
    fn test_numeric_beacon_is_accepted() {
        let value = json!({ "type": "function", "beacon": 12 });

        assert_eq!(placeholder_beacon(&value), Some(Beacon::from("12")));
    }

    #[test]
    fn test_unserializable_value_is_a_marshal_error() {
        let mut map = HashMap::new();
        map.insert(vec![1u8], "bytes as key");

        let result = Arg::value(&map);
        assert!(matches!(result, Err(BridgeError::Marshal(_))));
    }

    #[test]
    fn test_callback_identity_follows_the_allocation() {
        let a: Callback = Arc::new(|_: Vec<Value>| {});
        let b: Callback = Arc::new(|_: Vec<Value>| {});
        let a2 = Arc::clone(&a);

        assert_eq!(callback_identity(&a), callback_identity(&a2));
        assert_ne!(callback_identity(&a), callback_identity(&b));
    }
}
