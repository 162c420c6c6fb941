//! HTTP implementation of the store traits
//!
//! Talks to a REST-style bulk endpoint: one server-side transaction per
//! session, batch inserts appended to it, explicit commit/rollback. The
//! wire format is deliberately small; the traits in [`super`] stay the
//! seam and everything above them is transport-agnostic.

use super::{BatchOutcome, StoreCapabilities, StoreConnector, StoreSession};
use crate::config::StoreConfig;
use crate::error::{LoadError, Result};
use crate::placement::ShardRef;
use crate::types::{ContentKind, ContentRecord};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Wire form of one document insert
#[derive(Debug, Serialize)]
struct WireDocument<'a> {
    uri: &'a str,
    kind: &'static str,
    /// UTF-8 text for text-like kinds, base64 for binary
    body: String,
    body_encoding: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    collections: Vec<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    permissions: Vec<WirePermission<'a>>,
    #[serde(skip_serializing_if = "is_zero")]
    quality: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<&'a str>,
}

fn is_zero(quality: &i32) -> bool {
    *quality == 0
}

#[derive(Debug, Serialize)]
struct WirePermission<'a> {
    role: &'a str,
    capability: &'static str,
}

#[derive(Debug, Deserialize)]
struct TxnResponse {
    txn_id: String,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    accepted: u64,
    #[serde(default)]
    rejected: Vec<WireRejection>,
}

#[derive(Debug, Deserialize)]
struct WireRejection {
    uri: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct CapabilitiesResponse {
    #[serde(default = "default_true")]
    multi_doc_batch: bool,
}

fn default_true() -> bool {
    true
}

fn encode_document(record: &ContentRecord) -> WireDocument<'_> {
    let (body, body_encoding) = match record.kind {
        ContentKind::Xml | ContentKind::Json | ContentKind::Text => {
            match std::str::from_utf8(&record.body) {
                Ok(text) => (text.to_string(), "utf-8"),
                // declared text but not valid UTF-8: ship verbatim bytes
                Err(_) => (
                    base64::engine::general_purpose::STANDARD.encode(&record.body),
                    "base64",
                ),
            }
        }
        ContentKind::Binary => (
            base64::engine::general_purpose::STANDARD.encode(&record.body),
            "base64",
        ),
    };

    WireDocument {
        uri: &record.uri,
        kind: record.kind.as_str(),
        body,
        body_encoding,
        collections: record
            .metadata
            .collections
            .iter()
            .map(String::as_str)
            .collect(),
        permissions: record
            .metadata
            .permissions
            .iter()
            .map(|p| WirePermission {
                role: &p.role,
                capability: match p.capability {
                    crate::types::Capability::Read => "read",
                    crate::types::Capability::Insert => "insert",
                    crate::types::Capability::Update => "update",
                    crate::types::Capability::Execute => "execute",
                },
            })
            .collect(),
        quality: record.metadata.quality,
        properties: record.metadata.properties.as_deref(),
    }
}

/// Normalize a configured host into a validated base URL
///
/// Accepts `host:port` (plain HTTP assumed) or a full `http(s)://` URL;
/// any other scheme is refused.
fn base_url_for(host: &str) -> Result<url::Url> {
    let candidate = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    };

    let parsed = url::Url::parse(&candidate)
        .map_err(|e| LoadError::config(format!("Invalid store host '{}': {}", host, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(LoadError::config(format!(
            "Store host must use http or https scheme, got '{}'",
            scheme
        ))),
    }
}

/// Check if an error indicates a connection problem
fn is_connection_error(e: &reqwest::Error) -> bool {
    if e.is_connect() || e.is_timeout() {
        return true;
    }
    let msg = e.to_string().to_lowercase();
    msg.contains("connection")
        || msg.contains("refused")
        || msg.contains("timeout")
        || msg.contains("reset")
        || msg.contains("broken pipe")
        || msg.contains("eof")
}

fn classify(e: reqwest::Error, context: &str) -> LoadError {
    if is_connection_error(&e) {
        LoadError::connection(format!("{}: {}", context, e))
    } else {
        LoadError::store(format!("{}: {}", context, e))
    }
}

/// HTTP connector for a REST bulk endpoint
pub struct HttpStoreConnector {
    client: reqwest::Client,
    /// First configured host, used for startup metadata queries
    metadata_url: url::Url,
}

impl HttpStoreConnector {
    /// Build a connector from the store configuration
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let first = config
            .hosts
            .first()
            .ok_or_else(|| LoadError::config("store has no hosts"))?;
        let metadata_url = base_url_for(first)?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connection_timeout_ms))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| LoadError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            metadata_url,
        })
    }

    fn endpoint(&self, base: &url::Url, path: &str) -> Result<url::Url> {
        base.join(path)
            .map_err(|e| LoadError::config(format!("Invalid endpoint path '{}': {}", path, e)))
    }
}

#[async_trait]
impl StoreConnector for HttpStoreConnector {
    async fn capabilities(&self) -> Result<StoreCapabilities> {
        let url = self.endpoint(&self.metadata_url, "/v1/capabilities")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(e, "capabilities request failed"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // endpoint predates the capabilities route: single-document mode
            warn!("store does not expose capabilities, falling back to single-document batches");
            return Ok(StoreCapabilities {
                multi_doc_batch: false,
            });
        }

        let caps: CapabilitiesResponse = response
            .error_for_status()
            .map_err(|e| classify(e, "capabilities request rejected"))?
            .json()
            .await
            .map_err(|e| LoadError::Serialization(format!("capabilities response: {}", e)))?;

        Ok(StoreCapabilities {
            multi_doc_batch: caps.multi_doc_batch,
        })
    }

    async fn topology(&self) -> Result<Vec<ShardRef>> {
        let url = self.endpoint(&self.metadata_url, "/v1/topology")?;
        let shards: Vec<ShardRef> = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(e, "topology request failed"))?
            .error_for_status()
            .map_err(|e| classify(e, "topology request rejected"))?
            .json()
            .await
            .map_err(|e| LoadError::Serialization(format!("topology response: {}", e)))?;

        if shards.is_empty() {
            return Err(LoadError::connection("store reported an empty shard map"));
        }
        Ok(shards)
    }

    async fn connect(
        &self,
        host: &str,
        shard: Option<&ShardRef>,
    ) -> Result<Box<dyn StoreSession>> {
        let base = base_url_for(host)?;
        debug!(host, shard = shard.map(|s| s.id.as_str()), "opening store session");
        Ok(Box::new(HttpStoreSession {
            client: self.client.clone(),
            base,
            shard_id: shard.map(|s| s.id.clone()),
            txn_id: None,
        }))
    }
}

struct HttpStoreSession {
    client: reqwest::Client,
    base: url::Url,
    shard_id: Option<String>,
    txn_id: Option<String>,
}

impl HttpStoreSession {
    /// Open the server-side transaction lazily on first use
    async fn ensure_txn(&mut self) -> Result<String> {
        if let Some(id) = &self.txn_id {
            return Ok(id.clone());
        }

        let url = self
            .base
            .join("/v1/txn")
            .map_err(|e| LoadError::config(format!("Invalid transaction endpoint: {}", e)))?;
        let response: TxnResponse = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| classify(e, "transaction open failed"))?
            .error_for_status()
            .map_err(|e| classify(e, "transaction open rejected"))?
            .json()
            .await
            .map_err(|e| LoadError::Serialization(format!("transaction response: {}", e)))?;

        self.txn_id = Some(response.txn_id.clone());
        Ok(response.txn_id)
    }

    async fn txn_action(&mut self, action: &str) -> Result<()> {
        let Some(txn_id) = self.txn_id.take() else {
            // nothing written through this session yet
            return Ok(());
        };

        let url = self
            .base
            .join(&format!("/v1/txn/{}/{}", txn_id, action))
            .map_err(|e| LoadError::config(format!("Invalid transaction endpoint: {}", e)))?;
        self.client
            .post(url)
            .send()
            .await
            .map_err(|e| classify(e, "transaction request failed"))?
            .error_for_status()
            .map_err(|e| classify(e, "transaction request rejected"))?;
        Ok(())
    }
}

#[async_trait]
impl StoreSession for HttpStoreSession {
    async fn insert_batch(&mut self, docs: &[ContentRecord]) -> Result<BatchOutcome> {
        let txn_id = self.ensure_txn().await?;

        let mut url = self
            .base
            .join(&format!("/v1/txn/{}/batch", txn_id))
            .map_err(|e| LoadError::config(format!("Invalid batch endpoint: {}", e)))?;
        if let Some(shard) = &self.shard_id {
            url.query_pairs_mut().append_pair("shard", shard);
        }

        let payload: Vec<WireDocument<'_>> = docs.iter().map(encode_document).collect();
        let response: BatchResponse = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| classify(e, "batch write failed"))?
            .error_for_status()
            .map_err(|e| classify(e, "batch write rejected"))?
            .json()
            .await
            .map_err(|e| LoadError::Serialization(format!("batch response: {}", e)))?;

        let mut outcome = BatchOutcome::accepted(response.accepted);
        for rejection in response.rejected {
            outcome.reject(rejection.uri, rejection.reason);
        }
        Ok(outcome)
    }

    async fn commit(&mut self) -> Result<()> {
        self.txn_action("commit").await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.txn_action("rollback").await
    }

    async fn close(&mut self) -> Result<()> {
        if self.txn_id.is_some() {
            // an open transaction at close means uncommitted writes
            self.txn_action("rollback").await?;
        }
        Ok(())
    }
}
