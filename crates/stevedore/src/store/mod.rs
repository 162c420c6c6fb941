//! Destination store traits
//!
//! The pipeline talks to the store through two seams: a [`StoreConnector`]
//! that opens sessions against a host (and answers topology/capability
//! queries once at startup), and a [`StoreSession`] that owns one network
//! connection with one open transaction.
//!
//! Batch submission is all-or-nothing at the transport level; within an
//! accepted batch the store may still reject individual documents, which
//! the session reports through [`BatchOutcome::rejected`].

pub mod http;
pub mod testing;

use crate::error::Result;
use crate::placement::ShardRef;
use crate::types::ContentRecord;
use async_trait::async_trait;

/// Capabilities discovered once per destination at startup
#[derive(Debug, Clone, Copy)]
pub struct StoreCapabilities {
    /// Whether one write request may carry multiple documents
    ///
    /// When false the batch size is clamped to 1 and every add flushes.
    pub multi_doc_batch: bool,
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self {
            multi_doc_batch: true,
        }
    }
}

/// A document the store rejected inside an otherwise accepted batch
#[derive(Debug, Clone)]
pub struct RejectedDocument {
    pub uri: String,
    pub reason: String,
}

/// Result of one accepted batch write
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Documents the store accepted into the open transaction
    pub accepted: u64,
    /// Documents rejected individually (validation, permissions)
    pub rejected: Vec<RejectedDocument>,
}

impl BatchOutcome {
    /// Outcome with every document accepted
    pub fn accepted(count: u64) -> Self {
        Self {
            accepted: count,
            rejected: Vec::new(),
        }
    }

    /// Record a per-document rejection
    pub fn reject(&mut self, uri: impl Into<String>, reason: impl Into<String>) {
        self.rejected.push(RejectedDocument {
            uri: uri.into(),
            reason: reason.into(),
        });
    }

    /// Check whether any document was rejected
    pub fn has_rejections(&self) -> bool {
        !self.rejected.is_empty()
    }
}

/// Connection factory and startup-time metadata for one destination store
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Discover protocol capabilities (queried once at startup)
    async fn capabilities(&self) -> Result<StoreCapabilities>;

    /// Fetch the current shard map
    async fn topology(&self) -> Result<Vec<ShardRef>>;

    /// Open a session against a host
    ///
    /// `shard` is the direct-placement hint: when set, every write through
    /// the session targets that shard; when `None` the store places
    /// documents itself.
    async fn connect(&self, host: &str, shard: Option<&ShardRef>) -> Result<Box<dyn StoreSession>>;
}

/// A stateful connection bound to one shard (direct mode) or one host
/// (indirect mode), owning one open transaction
///
/// Sessions are worker-private and never shared across tasks.
#[async_trait]
pub trait StoreSession: Send {
    /// Submit one batch into the open transaction
    ///
    /// All-or-nothing at the transport level: an `Err` means nothing of the
    /// batch is in the transaction. An `Ok` outcome may carry per-document
    /// rejections.
    async fn insert_batch(&mut self, docs: &[ContentRecord]) -> Result<BatchOutcome>;

    /// Commit the open transaction
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Close the session, releasing the underlying connection
    async fn close(&mut self) -> Result<()>;
}
