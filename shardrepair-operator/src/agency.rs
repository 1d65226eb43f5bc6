//! HTTP client of the coordination store.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::config::Config;
use shardrepair_core::agency::{lookup, path_segments, AgencyClient};
use shardrepair_core::error::{AgencyError, AgencyResult};
use shardrepair_core::operations::{AgencyWriteTransaction, WriteOutcome};
use shardrepair_core::transactions::{encode_write_transaction, prefixed_key};

const READ_PATH: &str = "/_api/agency/read";
const WRITE_PATH: &str = "/_api/agency/write";

/// A coordination store client speaking the agency's HTTP API.
pub struct HttpAgency {
    client: reqwest::Client,
    endpoint: String,
    prefix: String,
    jwt: Option<String>,
}

impl HttpAgency {
    /// Create a new instance.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("error building coordination store HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.agency_endpoint.trim_end_matches('/').to_string(),
            prefix: config.agency_prefix.clone(),
            jwt: config.agency_jwt.clone(),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> AgencyResult<(StatusCode, Value)> {
        let mut req = self.client.post(format!("{}{}", self.endpoint, path)).json(body);
        if let Some(jwt) = &self.jwt {
            req = req.bearer_auth(jwt);
        }
        let res = req.send().await.map_err(|err| AgencyError::Unreachable(err.to_string()))?;
        let status = res.status();
        if status.is_server_error() {
            return Err(AgencyError::Unreachable(format!("coordination store answered {}", status)));
        }
        let body = res
            .json::<Value>()
            .await
            .map_err(|err| AgencyError::Protocol(format!("error decoding response with status {}: {}", status, err)))?;
        Ok((status, body))
    }
}

#[async_trait]
impl AgencyClient for HttpAgency {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn read(&self, path: &str) -> AgencyResult<Option<Value>> {
        let (status, body) = self.post(READ_PATH, &encode_read_request(&self.prefix, path)).await?;
        if !status.is_success() {
            return Err(AgencyError::Protocol(format!("read of {} answered {}: {}", path, status, body)));
        }
        extract_read_result(&body, &self.prefix, path)
    }

    #[tracing::instrument(level = "trace", skip(self, txn))]
    async fn write(&self, txn: &AgencyWriteTransaction) -> AgencyResult<WriteOutcome> {
        let body = Value::Array(vec![encode_write_transaction(txn, &self.prefix)]);
        let (status, body) = self.post(WRITE_PATH, &body).await?;
        write_outcome(status, &body)
    }
}

/// Encode a read of a single key in the store's wire format.
pub fn encode_read_request(prefix: &str, path: &str) -> Value {
    json!([[prefixed_key(prefix, path)]])
}

/// Extract the value read under `path` from a read response.
///
/// The store answers with one full tree per query, rooted at the store root.
pub fn extract_read_result(body: &Value, prefix: &str, path: &str) -> AgencyResult<Option<Value>> {
    let tree = body
        .as_array()
        .and_then(|results| results.first())
        .ok_or_else(|| AgencyError::Protocol(format!("unexpected read response {}", body)))?;
    let full_path = prefixed_key(prefix, path);
    Ok(lookup(tree, &path_segments(&full_path)).cloned())
}

/// Interpret the answer to a write.
///
/// The store answers 412 when a precondition failed, and reports a zero raft index for every
/// transaction which was not applied.
pub fn write_outcome(status: StatusCode, body: &Value) -> AgencyResult<WriteOutcome> {
    if status == StatusCode::PRECONDITION_FAILED {
        return Ok(WriteOutcome::PreconditionFailed);
    }
    if !status.is_success() {
        return Err(AgencyError::Protocol(format!("write answered {}: {}", status, body)));
    }
    match body.get("results").and_then(Value::as_array).and_then(|results| results.first()).and_then(Value::as_u64) {
        Some(0) => Ok(WriteOutcome::PreconditionFailed),
        Some(_) => Ok(WriteOutcome::Applied),
        None => Err(AgencyError::Protocol(format!("unexpected write response {}", body))),
    }
}
