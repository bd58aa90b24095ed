//! Solana JSON-RPC activity feed (`getSignaturesForAddress`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::watcher::error::WatchError;
use crate::watcher::feed::ActivityFeed;
use crate::watcher::types::ActivityRecord;

pub struct RpcActivityFeed {
    url: String,
    commitment: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: (&'a str, SignaturesConfig<'a>),
}

#[derive(Serialize)]
struct SignaturesConfig<'a> {
    limit: usize,
    commitment: &'a str,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Vec<Value>>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureInfo {
    signature: String,
    #[serde(default)]
    block_time: Option<i64>,
}

impl RpcActivityFeed {
    pub fn new(url: impl Into<String>, commitment: impl Into<String>, timeout: Duration) -> Result<Self, WatchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WatchError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            url: url.into(),
            commitment: commitment.into(),
            http,
        })
    }
}

#[async_trait]
impl ActivityFeed for RpcActivityFeed {
    async fn fetch_recent(&self, address: &str, limit: usize) -> Result<Vec<ActivityRecord>, WatchError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "getSignaturesForAddress",
            params: (
                address,
                SignaturesConfig {
                    limit,
                    commitment: &self.commitment,
                },
            ),
        };

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| WatchError::UpstreamQuery(format!("HTTP error: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(WatchError::UpstreamQuery(format!("{status}: {body}")));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| WatchError::UpstreamQuery(format!("parse error: {e}")))?;

        records_from_response(address, body)
    }
}

fn records_from_response(address: &str, body: RpcResponse) -> Result<Vec<ActivityRecord>, WatchError> {
    if let Some(err) = body.error {
        return Err(WatchError::UpstreamQuery(format!("RPC error {}: {}", err.code, err.message)));
    }

    let entries = body.result.unwrap_or_default();
    let mut records = Vec::with_capacity(entries.len());
    for raw in entries {
        let info: SignatureInfo = serde_json::from_value(raw.clone())
            .map_err(|e| WatchError::UpstreamQuery(format!("malformed signature entry: {e}")))?;
        let timestamp = info
            .block_time
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        records.push(ActivityRecord {
            id: info.signature,
            address: address.to_string(),
            timestamp,
            raw,
        });
    }
    Ok(records)
}
