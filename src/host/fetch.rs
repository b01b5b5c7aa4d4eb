//! `fetch` proxied through the host, outside the page's network restrictions

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use reqwest::Url;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};

/// Subset of the `fetch` init dictionary the host honors
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

/// Response-like object handed back to the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    pub status_text: String,
    /// True for 2xx statuses
    pub ok: bool,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Perform an HTTP(S) request on behalf of the page
///
/// Non-2xx statuses resolve normally with `ok == false`; only transport
/// failures reject.
pub async fn fetch(
    url: &str,
    options: FetchOptions,
    config: Arc<BridgeConfig>,
) -> BridgeResult<FetchResponse> {
    let url = Url::parse(url).map_err(|e| BridgeError::Fetch(format!("invalid URL {url}: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(BridgeError::UnsupportedScheme(other.to_string())),
    }

    tracing::debug!(url = %url, method = ?options.method, "proxying fetch");
    blocking::unblock(move || send(url, options, &config)).await
}

fn send(url: Url, options: FetchOptions, config: &BridgeConfig) -> BridgeResult<FetchResponse> {
    let mut builder = Client::builder().timeout(config.fetch_timeout());
    if !config.fetch_system_proxy() {
        builder = builder.no_proxy();
    }
    let client = builder.build().map_err(|e| BridgeError::Fetch(e.to_string()))?;

    let method = options.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|e| BridgeError::Fetch(format!("invalid method {method}: {e}")))?;

    let mut request = client.request(method, url);
    for (name, value) in &options.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = options.body {
        request = request.body(body);
    }

    let response = request.send().map_err(|e| BridgeError::Fetch(e.to_string()))?;
    let status = response.status();
    let url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    let body = response.text().map_err(|e| BridgeError::Fetch(e.to_string()))?;

    Ok(FetchResponse {
        url,
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        ok: status.is_success(),
        headers,
        body,
    })
}
