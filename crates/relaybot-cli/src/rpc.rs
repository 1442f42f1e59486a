use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

/// JSON-RPC client for the gateway's `/rpc` endpoint.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
            next_id: AtomicU64::new(1),
        }
    }

    /// Default endpoint for a gateway bound to `host:port`.
    pub fn default_url(host: &str, port: u16) -> String {
        format!("http://{host}:{port}/rpc")
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(method, url = %self.url, id, "rpc call");
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .await
            .with_context(|| format!("Failed to reach gateway at {}", self.url))?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            bail!("Gateway rejected the auth token");
        }
        let response: Value = resp.json().await.context("Failed to parse gateway response")?;
        unwrap_response(response)
    }
}

/// The `result` of a JSON-RPC response, or its error as an `anyhow` error.
fn unwrap_response(mut response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        let message = error.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error");
        let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        bail!("{message} (code {code})");
    }
    Ok(response.get_mut("result").map(Value::take).unwrap_or(Value::Null))
}
