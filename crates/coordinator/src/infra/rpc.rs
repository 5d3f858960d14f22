use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{debug, warn};
use reqwest::Client as ReqwestClient;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::metrics::RPC_LATENCY;

const RPC_TIMEOUT_SECS: u64 = 25;

/// Transport/parse failures bridge as 502-equivalent; RPC-level error objects as 500-equivalent.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    #[error("wallet rpc unavailable: {0}")]
    Unavailable(String),
    #[error("wallet rpc error: {0}")]
    Remote(String),
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    #[allow(dead_code)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

/// Thin, synchronous-in-spirit client over HTTP+basic-auth to `<base>/wallet/<wallet_name>`.
///
/// No retries here by design — the caller decides idempotency per endpoint.
#[derive(Clone)]
pub struct WalletRpcClient {
    url: String,
    user: String,
    pass: String,
    client: ReqwestClient,
    next_id: std::sync::Arc<AtomicU64>,
}

impl WalletRpcClient {
    pub fn new(base_url: &str, wallet_name: &str, user: String, pass: String) -> Self {
        let url = format!(
            "{}/wallet/{}",
            base_url.trim_end_matches('/'),
            wallet_name
        );
        let client = ReqwestClient::builder()
            .timeout(Duration::from_secs(RPC_TIMEOUT_SECS))
            .build()
            .expect("failed to build wallet rpc http client");
        Self {
            url,
            user,
            pass,
            client,
            next_id: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let id = self.next_id();
        let body = JsonRpcRequest {
            jsonrpc: "1.0",
            id,
            method,
            params,
        };

        let basic = BASE64.encode(format!("{}:{}", self.user, self.pass));
        let timer = RPC_LATENCY.with_label_values(&[method]).start_timer();
        debug!("calling wallet rpc {method}");

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Basic {basic}"))
            .json(&body)
            .send()
            .await;
        timer.observe_duration();

        let response = response.map_err(|e| {
            warn!("wallet rpc transport error calling {method}: {e}");
            RpcError::Unavailable(e.to_string())
        })?;

        let raw = response.text().await.map_err(|e| {
            warn!("wallet rpc failed reading body for {method}: {e}");
            RpcError::Unavailable(e.to_string())
        })?;

        let parsed: JsonRpcResponse<T> = serde_json::from_str(&raw).map_err(|e| {
            warn!("wallet rpc failed parsing response for {method}: {e}");
            RpcError::Unavailable(format!("parse error: {e}"))
        })?;

        if let Some(err) = parsed.error {
            return Err(RpcError::Remote(err.message));
        }

        parsed
            .result
            .ok_or_else(|| RpcError::Unavailable("empty result".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wallet_url_is_joined_correctly() {
        let client = WalletRpcClient::new(
            "http://127.0.0.1:8332/",
            "escrow",
            "user".into(),
            "pass".into(),
        );
        assert_eq!(client.url, "http://127.0.0.1:8332/wallet/escrow");
    }

    #[test]
    fn request_ids_are_monotonic() {
        let client = WalletRpcClient::new(
            "http://127.0.0.1:8332",
            "escrow",
            "user".into(),
            "pass".into(),
        );
        let a = client.next_id();
        let b = client.next_id();
        assert!(b > a);
    }
}
