//! Latest block through the tx-indexer's JSON-RPC event filters.
//!
//! Instead of asking for blocks in a time range, the provider registers a block filter once
//! (`newBlockFilter`) and then asks for everything that changed since the last call
//! (`getFilterChanges`). Changes come as base64 strings, each holding newline-delimited JSON blocks.

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::{de::DeserializeOwned, Deserialize};
use serde_with::{base64::Base64, serde_as};
use tokio::sync::Mutex;

use crate::{BlockHeader, BlockSource, RawBlock};

const NEW_BLOCK_FILTER: &str = "newBlockFilter";
const GET_FILTER_CHANGES: &str = "getFilterChanges";

pub struct JsonRpcFilterProvider {
    endpoint: String,
    client: reqwest::Client,
    filter_id: Mutex<Option<String>>,
    next_request_id: AtomicU64,
}

impl JsonRpcFilterProvider {
    pub fn with_endpoint(endpoint: String) -> Self {
        Self::with_endpoint_and_client(endpoint, crate::http_client())
    }

    pub fn with_endpoint_and_client(endpoint: String, client: reqwest::Client) -> Self {
        Self {
            endpoint,
            client,
            filter_id: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<T, JsonRpcError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(
                serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": method,
                    "params": params,
                })
                .to_string(),
            )
            .send()
            .await?;
        let text = response.text().await?;
        let response = match serde_json::from_str::<JsonRpcResponse<T>>(&text) {
            Ok(response) => response,
            Err(err) => {
                return Err(JsonRpcError::FailedToParse {
                    err,
                    response: text,
                })
            }
        };
        if let Some(error) = response.error {
            return Err(JsonRpcError::Rpc {
                method,
                code: error.code,
                message: error.message,
            });
        }
        response.result.ok_or(JsonRpcError::MissingResult(method))
    }

    /// Blocks added since the previous call. The first call registers the filter and then
    /// fetches its changes in the same call.
    pub async fn block_changes(&self) -> Result<Vec<BlockHeader>, JsonRpcError> {
        let mut filter_id = self.filter_id.lock().await;
        let id = match filter_id.as_ref() {
            Some(id) => id.clone(),
            None => {
                let id: String = self.call(NEW_BLOCK_FILTER, serde_json::json!([])).await?;
                log::info!(target: "gnopoller::jsonrpc_filter", "Registered block filter {id}");
                *filter_id = Some(id.clone());
                id
            }
        };
        let changes: FilterChanges = match self
            .call(GET_FILTER_CHANGES, serde_json::json!([id]))
            .await
        {
            Ok(changes) => changes,
            Err(err) => {
                if matches!(err, JsonRpcError::Rpc { .. }) {
                    log::warn!(target: "gnopoller::jsonrpc_filter", "Dropping block filter {id}, a new one will be registered");
                    *filter_id = None;
                }
                return Err(err);
            }
        };
        drop(filter_id);
        decode_blocks(&changes.0)
    }
}

/// Parses every non-empty line of every decoded payload as a block.
fn decode_blocks(payloads: &[Vec<u8>]) -> Result<Vec<BlockHeader>, JsonRpcError> {
    let mut blocks = Vec::new();
    for payload in payloads {
        let payload = std::str::from_utf8(payload).map_err(JsonRpcError::InvalidPayload)?;
        for line in payload.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<RawBlock>(line) {
                Ok(block) => blocks.push(BlockHeader::from(block)),
                Err(err) => {
                    return Err(JsonRpcError::FailedToParse {
                        err,
                        response: line.to_string(),
                    })
                }
            }
        }
    }
    Ok(blocks)
}

#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcErrorObject>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

#[serde_as]
#[derive(Deserialize, Debug)]
struct FilterChanges(#[serde_as(as = "Vec<Base64>")] Vec<Vec<u8>>);

#[async_trait]
impl BlockSource for JsonRpcFilterProvider {
    type Error = JsonRpcError;

    /// `since` is ignored, the filter remembers what was already returned. A tick with no
    /// new blocks returns an empty list and keeps the current block.
    async fn recent_blocks(&self, _since: DateTime<Utc>) -> Result<Vec<BlockHeader>, Self::Error> {
        self.block_changes().await
    }
}

#[derive(Debug)]
pub enum JsonRpcError {
    FailedToParse {
        err: serde_json::Error,
        response: String,
    },
    InvalidPayload(std::str::Utf8Error),
    Rpc {
        method: &'static str,
        code: i64,
        message: String,
    },
    MissingResult(&'static str),
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl From<reqwest::Error> for JsonRpcError {
    fn from(err: reqwest::Error) -> Self {
        JsonRpcError::Other(Box::new(err))
    }
}

impl Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JsonRpcError::FailedToParse { err, response } => {
                write!(f, "Failed to parse response: {err:?}\nResponse: {response}")
            }
            JsonRpcError::InvalidPayload(err) => write!(f, "Filter payload is not UTF-8: {err}"),
            JsonRpcError::Rpc {
                method,
                code,
                message,
            } => write!(f, "{method} failed: {message} (code {code})"),
            JsonRpcError::MissingResult(method) => write!(f, "{method} returned no result"),
            JsonRpcError::Other(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for JsonRpcError {}
