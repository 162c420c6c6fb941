//! Content writer: batching, transactions, and retry for one worker
//!
//! A [`ContentWriter`] is one worker's private pipeline instance. It owns
//! per-shard batch slots, lazily opened store sessions, and the outcome
//! counters. Nothing in here is shared across tasks; workers communicate
//! results only through the counters returned by [`ContentWriter::close`].
//!
//! Ordering: batches for one shard slot are flushed in the order records
//! were added. Across slots there is no ordering guarantee and no
//! cross-session atomicity.

use crate::balancer::HostBalancer;
use crate::config::RetryConfig;
use crate::error::{LoadError, Result};
use crate::placement::ShardMap;
use crate::store::{BatchOutcome, StoreCapabilities, StoreConnector, StoreSession};
use crate::types::{ContentRecord, WriteCounters};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How the writer routes documents to the store
#[derive(Clone)]
pub enum WritePlacement {
    /// Address shards directly: one slot and session per shard, targets
    /// resolved through the shard map
    Direct(ShardMap),
    /// Go through cluster entry hosts: one slot, sessions rotated across
    /// the entry hosts at commit boundaries
    Indirect { entry_hosts: Vec<String> },
}

impl WritePlacement {
    fn slot_count(&self) -> usize {
        match self {
            Self::Direct(map) => map.len(),
            Self::Indirect { .. } => 1,
        }
    }
}

/// Sizing and retry knobs for one writer
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Documents per batch write (already clamped for the destination)
    pub batch_size: usize,
    /// Batches per commit
    pub txn_size: u32,
    /// Retry policy for failed batch writes
    pub retry: RetryConfig,
}

/// Clamp the configured batch size to what the destination supports
pub fn effective_batch_size(configured: usize, capabilities: &StoreCapabilities) -> usize {
    if capabilities.multi_doc_batch {
        configured.max(1)
    } else {
        1
    }
}

struct SessionState {
    session: Box<dyn StoreSession>,
    /// Batches written since the last commit
    statements_since_commit: u32,
    /// URIs accepted into the open transaction, not yet committed
    pending: Vec<String>,
}

/// One worker's private write pipeline
pub struct ContentWriter {
    connector: Arc<dyn StoreConnector>,
    placement: WritePlacement,
    balancer: Option<Arc<HostBalancer>>,
    config: WriterConfig,
    slots: Vec<Vec<ContentRecord>>,
    sessions: Vec<Option<SessionState>>,
    /// Per-slot replica cursor, advanced when a direct session is discarded
    replica_cursors: Vec<usize>,
    /// Entry-host cursor, advanced per session creation in indirect mode
    host_cursor: usize,
    counters: WriteCounters,
    shutdown: Arc<AtomicBool>,
    closed: bool,
}

impl ContentWriter {
    /// Create a writer
    ///
    /// `config.batch_size` must already reflect the destination's
    /// capabilities (see [`effective_batch_size`]).
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        placement: WritePlacement,
        balancer: Option<Arc<HostBalancer>>,
        config: WriterConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let slot_count = placement.slot_count();
        match &placement {
            WritePlacement::Direct(map) if map.is_empty() => {
                return Err(LoadError::config("direct placement requires a shard map"));
            }
            WritePlacement::Indirect { entry_hosts } if entry_hosts.is_empty() => {
                return Err(LoadError::config("indirect placement requires entry hosts"));
            }
            _ => {}
        }
        if config.batch_size == 0 {
            return Err(LoadError::config("batch_size must be at least 1"));
        }
        if config.txn_size == 0 {
            return Err(LoadError::config("txn_size must be at least 1"));
        }

        Ok(Self {
            connector,
            placement,
            balancer,
            slots: (0..slot_count)
                .map(|_| Vec::with_capacity(config.batch_size))
                .collect(),
            sessions: (0..slot_count).map(|_| None).collect(),
            replica_cursors: vec![0; slot_count],
            host_cursor: 0,
            config,
            counters: WriteCounters::default(),
            shutdown,
            closed: false,
        })
    }

    /// Current outcome counters
    pub fn counters(&self) -> WriteCounters {
        self.counters
    }

    /// Add one record to its shard slot, flushing the slot when full
    ///
    /// An error means the flushed batch permanently failed; the failure is
    /// already reflected in the counters and the writer stays usable for
    /// subsequent records.
    pub async fn put(&mut self, record: ContentRecord) -> Result<()> {
        if self.closed {
            return Err(LoadError::Internal("put on a closed writer".to_string()));
        }

        let slot = match &self.placement {
            WritePlacement::Direct(map) => map.shard_index(&record.uri),
            WritePlacement::Indirect { .. } => 0,
        };
        self.slots[slot].push(record);

        if self.slots[slot].len() >= self.config.batch_size {
            self.flush_slot(slot).await?;
        }
        Ok(())
    }

    /// Account for a record the reader skipped
    pub fn record_skipped(&mut self, uri: &str, reason: &str) {
        warn!(uri, reason, "record skipped");
        self.counters.failed += 1;
    }

    /// Flush remaining partial batches, commit every session with
    /// outstanding statements, and close all sessions
    ///
    /// Best-effort drain: failures are logged and counted, never
    /// propagated, and closing one session does not block the rest.
    /// Idempotent: a second close returns the same counters unchanged.
    pub async fn close(&mut self) -> WriteCounters {
        if self.closed {
            return self.counters;
        }
        self.closed = true;

        for slot in 0..self.slots.len() {
            if !self.slots[slot].is_empty() {
                if let Err(e) = self.flush_slot(slot).await {
                    warn!(slot, error = %e, "final batch flush failed");
                }
            }
        }

        for slot in 0..self.sessions.len() {
            if let Err(e) = self.commit_slot(slot).await {
                warn!(slot, error = %e, "final commit failed");
            }
            if let Some(mut state) = self.sessions[slot].take() {
                if let Err(e) = state.session.close().await {
                    debug!(slot, error = %e, "session close failed");
                }
            }
        }

        self.counters
    }

    async fn flush_slot(&mut self, slot: usize) -> Result<()> {
        if self.slots[slot].is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.slots[slot]);
        self.slots[slot] = Vec::with_capacity(self.config.batch_size);
        self.submit(slot, batch).await
    }

    /// Submit one batch with bounded retries
    ///
    /// `max_retries` bounds the total number of submission attempts. The
    /// request is rebuilt from the immutable batch on every attempt, so a
    /// failed attempt cannot leak partial state into the next one.
    async fn submit(&mut self, slot: usize, batch: Vec<ContentRecord>) -> Result<()> {
        let max_attempts = self.config.retry.max_retries.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.try_write(slot, &batch).await {
                Ok(outcome) => {
                    self.apply_outcome(slot, &batch, outcome);
                    let commit_due = self.sessions[slot]
                        .as_ref()
                        .is_some_and(|s| s.statements_since_commit >= self.config.txn_size);
                    if commit_due {
                        self.commit_slot(slot).await?;
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!(slot, attempt, max_attempts, error = %e, "batch write failed");
                    self.handle_write_failure(slot).await;

                    if !e.is_retryable() {
                        self.fail_batch(&batch);
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        self.fail_batch(&batch);
                        return Err(LoadError::RetriesExhausted {
                            attempts: attempt,
                            message: e.to_string(),
                        });
                    }
                    if self.shutdown.load(Ordering::SeqCst) {
                        self.fail_batch(&batch);
                        return Err(LoadError::Shutdown);
                    }

                    let delay = self.config.retry.backoff_for_attempt(attempt);
                    info!(
                        slot,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying batch write"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_write(&mut self, slot: usize, batch: &[ContentRecord]) -> Result<BatchOutcome> {
        self.ensure_session(slot).await?;
        let state = self.sessions[slot]
            .as_mut()
            .expect("session exists after ensure_session");
        state.session.insert_batch(batch).await
    }

    /// Record a successful write: count rejections, track accepted URIs
    fn apply_outcome(&mut self, slot: usize, batch: &[ContentRecord], outcome: BatchOutcome) {
        for rejection in &outcome.rejected {
            warn!(uri = %rejection.uri, reason = %rejection.reason, "document rejected by store");
        }
        self.counters.failed += outcome.rejected.len() as u64;

        let rejected: HashSet<&str> = outcome.rejected.iter().map(|r| r.uri.as_str()).collect();
        let state = self.sessions[slot]
            .as_mut()
            .expect("session exists after successful write");
        for doc in batch {
            if !rejected.contains(doc.uri.as_str()) {
                state.pending.push(doc.uri.clone());
            }
        }
        state.statements_since_commit += 1;
    }

    /// Roll back after a failed write and discard the session
    ///
    /// The rollback voids everything the transaction had accepted, so the
    /// previously pending URIs are counted failed here since they will not
    /// be re-sent. Only the current batch is retried, in a fresh session.
    async fn handle_write_failure(&mut self, slot: usize) {
        if let Some(state) = self.sessions[slot].as_mut() {
            if let Err(e) = state.session.rollback().await {
                warn!(slot, error = %e, "rollback failed");
            }
            let rolled_back = state.pending.len() as u64;
            if rolled_back > 0 {
                warn!(
                    slot,
                    count = rolled_back,
                    "uncommitted documents voided by rollback, counted failed"
                );
                self.counters.failed += rolled_back;
                state.pending.clear();
            }
            state.statements_since_commit = 0;
        }
        self.discard_session(slot).await;
    }

    fn fail_batch(&mut self, batch: &[ContentRecord]) {
        self.counters.failed += batch.len() as u64;
    }

    /// Commit the slot's open transaction if it has outstanding statements
    async fn commit_slot(&mut self, slot: usize) -> Result<()> {
        let rotate_after = matches!(self.placement, WritePlacement::Indirect { .. });

        let Some(state) = self.sessions[slot].as_mut() else {
            return Ok(());
        };
        if state.statements_since_commit == 0 {
            return Ok(());
        }

        let result = state.session.commit().await;
        match result {
            Ok(()) => {
                let committed = state.pending.len() as u64;
                self.counters.committed += committed;
                state.pending.clear();
                state.statements_since_commit = 0;
                debug!(slot, committed, "transaction committed");

                // spread subsequent writes across cluster entry points
                if rotate_after {
                    self.discard_session(slot).await;
                }
                Ok(())
            }
            Err(e) => {
                error!(slot, error = %e, "commit failed, failing pending documents");
                let failed = state.pending.len() as u64;
                self.counters.failed += failed;
                state.pending.clear();
                state.statements_since_commit = 0;
                if let Err(re) = state.session.rollback().await {
                    debug!(slot, error = %re, "rollback after failed commit also failed");
                }
                self.discard_session(slot).await;
                Err(e)
            }
        }
    }

    /// Open the slot's session if absent
    async fn ensure_session(&mut self, slot: usize) -> Result<()> {
        if self.sessions[slot].is_some() {
            return Ok(());
        }

        let (host, shard) = match &self.placement {
            WritePlacement::Direct(map) => {
                let shard = map.shard(slot);
                if shard.hosts.is_empty() {
                    return Err(LoadError::connection(format!(
                        "shard '{}' has no serving hosts",
                        shard.id
                    )));
                }
                let cursor = self.replica_cursors[slot] % shard.hosts.len();
                (shard.hosts[cursor].clone(), Some(shard.clone()))
            }
            WritePlacement::Indirect { entry_hosts } => {
                let host = entry_hosts[self.host_cursor % entry_hosts.len()].clone();
                self.host_cursor = self.host_cursor.wrapping_add(1);
                (host, None)
            }
        };

        let host = match &self.balancer {
            Some(balancer) => balancer.resolve(&host),
            None => host,
        };

        let session = self.connector.connect(&host, shard.as_ref()).await?;
        debug!(slot, host, "opened store session");
        self.sessions[slot] = Some(SessionState {
            session,
            statements_since_commit: 0,
            pending: Vec::new(),
        });
        Ok(())
    }

    /// Close and drop the slot's session; the next write opens a fresh one
    async fn discard_session(&mut self, slot: usize) {
        if let Some(mut state) = self.sessions[slot].take() {
            if let Err(e) = state.session.close().await {
                debug!(slot, error = %e, "session close failed");
            }
        }
        if matches!(self.placement, WritePlacement::Direct(_)) {
            // next session for this shard goes to the next replica
            self.replica_cursors[slot] = self.replica_cursors[slot].wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::MemoryStore;
    use crate::types::ContentKind;

    fn doc(uri: &str) -> ContentRecord {
        ContentRecord::new(uri, "body", ContentKind::Text)
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
        }
    }

    fn writer_config(batch_size: usize, txn_size: u32) -> WriterConfig {
        WriterConfig {
            batch_size,
            txn_size,
            retry: fast_retry(3),
        }
    }

    fn indirect_writer(store: &MemoryStore, config: WriterConfig) -> ContentWriter {
        ContentWriter::new(
            Arc::new(store.clone()),
            WritePlacement::Indirect {
                entry_hosts: vec!["h1".to_string(), "h2".to_string()],
            },
            None,
            config,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    #[test]
    fn test_effective_batch_size_clamps_without_multi_doc() {
        let batching = StoreCapabilities {
            multi_doc_batch: true,
        };
        let single = StoreCapabilities {
            multi_doc_batch: false,
        };
        assert_eq!(effective_batch_size(100, &batching), 100);
        assert_eq!(effective_batch_size(100, &single), 1);
        assert_eq!(effective_batch_size(0, &batching), 1);
    }

    #[tokio::test]
    async fn test_batch_flushes_exactly_at_capacity() {
        let store = MemoryStore::new();
        let mut writer = indirect_writer(&store, writer_config(3, 100));

        writer.put(doc("/a")).await.unwrap();
        writer.put(doc("/b")).await.unwrap();
        assert_eq!(store.insert_attempts(), 0);

        writer.put(doc("/c")).await.unwrap();
        assert_eq!(store.insert_attempts(), 1);

        // slot was reset: two more records do not flush yet
        writer.put(doc("/d")).await.unwrap();
        writer.put(doc("/e")).await.unwrap();
        assert_eq!(store.insert_attempts(), 1);

        let counters = writer.close().await;
        assert_eq!(counters.committed, 5);
        assert_eq!(counters.failed, 0);
        assert_eq!(store.committed_count(), 5);
    }

    #[tokio::test]
    async fn test_commit_every_txn_size_batches() {
        let store = MemoryStore::new();
        let mut writer = indirect_writer(&store, writer_config(2, 2));

        for i in 0..8 {
            writer.put(doc(&format!("/doc-{}", i))).await.unwrap();
        }
        // 4 batches of 2, committed after every second batch
        assert_eq!(store.insert_attempts(), 4);
        assert_eq!(store.commit_count(), 2);
        assert_eq!(store.committed_count(), 8);

        let counters = writer.close().await;
        assert_eq!(counters.committed, 8);
        assert_eq!(store.commit_count(), 2);
    }

    #[tokio::test]
    async fn test_single_document_mode_flushes_every_put() {
        let store = MemoryStore::new().with_capabilities(StoreCapabilities {
            multi_doc_batch: false,
        });
        let capabilities = store.capabilities().await.unwrap();
        let config = WriterConfig {
            batch_size: effective_batch_size(100, &capabilities),
            txn_size: 100,
            retry: fast_retry(3),
        };
        let mut writer = indirect_writer(&store, config);

        writer.put(doc("/a")).await.unwrap();
        writer.put(doc("/b")).await.unwrap();
        assert_eq!(store.insert_attempts(), 2);

        writer.close().await;
        assert_eq!(store.committed_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_bound_is_total_attempts() {
        let store = MemoryStore::new().always_fail_inserts();
        let mut writer = indirect_writer(
            &store,
            WriterConfig {
                batch_size: 2,
                txn_size: 10,
                retry: fast_retry(3),
            },
        );

        writer.put(doc("/a")).await.unwrap();
        let err = writer.put(doc("/b")).await.unwrap_err();
        assert!(matches!(err, LoadError::RetriesExhausted { attempts: 3, .. }));

        // exactly 3 submission attempts, both documents failed exactly once
        assert_eq!(store.insert_attempts(), 3);
        let counters = writer.close().await;
        assert_eq!(counters.failed, 2);
        assert_eq!(counters.committed, 0);
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failures() {
        let store = MemoryStore::new().fail_first_inserts(2);
        let mut writer = indirect_writer(&store, writer_config(1, 10));

        writer.put(doc("/a")).await.unwrap();
        assert_eq!(store.insert_attempts(), 3);

        let counters = writer.close().await;
        assert_eq!(counters.committed, 1);
        assert_eq!(counters.failed, 0);
        assert_eq!(store.committed_uris(), vec!["/a"]);
    }

    #[tokio::test]
    async fn test_partial_rejection_counts_subset_failed() {
        let store = MemoryStore::new().reject_uris(["/bad-1", "/bad-2"]);
        let mut writer = indirect_writer(&store, writer_config(5, 1));

        for uri in ["/ok-1", "/bad-1", "/ok-2", "/bad-2", "/ok-3"] {
            writer.put(doc(uri)).await.unwrap();
        }
        let counters = writer.close().await;

        assert_eq!(counters.failed, 2);
        assert_eq!(counters.committed, 3);
        assert_eq!(counters.total(), 5);
        assert_eq!(store.committed_uris(), vec!["/ok-1", "/ok-2", "/ok-3"]);
    }

    #[tokio::test]
    async fn test_rollback_voids_pending_uncommitted_documents() {
        // first batch accepted, everything after fails permanently
        let store = MemoryStore::new().fail_inserts_after(1);
        let mut writer = indirect_writer(&store, writer_config(1, 10));

        writer.put(doc("/first")).await.unwrap();
        let err = writer.put(doc("/second")).await.unwrap_err();
        assert!(matches!(err, LoadError::RetriesExhausted { .. }));

        let counters = writer.close().await;
        // "/first" was rolled back with the transaction, "/second" exhausted
        // its retries; each is counted failed exactly once
        assert_eq!(counters.failed, 2);
        assert_eq!(counters.committed, 0);
        assert_eq!(store.committed_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_failure_fails_pending_and_surfaces() {
        let store = MemoryStore::new().fail_first_commits(1);
        // txn_size 1: the commit fires right after the first batch
        let mut writer = indirect_writer(&store, writer_config(1, 1));

        let err = writer.put(doc("/a")).await.unwrap_err();
        assert!(err.is_retryable());

        let counters = writer.close().await;
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.committed, 0);
        assert_eq!(store.committed_count(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_best_effort_on_commit_failure() {
        let store = MemoryStore::new().fail_first_commits(1);
        let mut writer = indirect_writer(&store, writer_config(10, 10));

        writer.put(doc("/a")).await.unwrap();
        writer.put(doc("/b")).await.unwrap();

        // the close-time commit fails; close still finishes and accounts
        // for every document exactly once
        let counters = writer.close().await;
        assert_eq!(counters.failed, 2);
        assert_eq!(counters.committed, 0);
        assert_eq!(counters, writer.close().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = MemoryStore::new();
        let mut writer = indirect_writer(&store, writer_config(10, 10));

        writer.put(doc("/a")).await.unwrap();
        let first = writer.close().await;
        let second = writer.close().await;

        assert_eq!(first, second);
        assert_eq!(store.commit_count(), 1);
        assert_eq!(store.committed_count(), 1);

        let err = writer.put(doc("/late")).await.unwrap_err();
        assert!(matches!(err, LoadError::Internal(_)));
    }

    #[tokio::test]
    async fn test_indirect_mode_rotates_hosts_at_commit_boundaries() {
        let store = MemoryStore::new();
        let mut writer = indirect_writer(&store, writer_config(1, 1));

        for i in 0..3 {
            writer.put(doc(&format!("/doc-{}", i))).await.unwrap();
        }
        writer.close().await;

        // txn_size 1: every batch commits and rotates to the next entry host
        assert_eq!(store.hosts_seen(), vec!["h1", "h2", "h1"]);
        assert_eq!(store.committed_count(), 3);
    }

    #[tokio::test]
    async fn test_direct_mode_routes_by_shard() {
        let store = MemoryStore::new().with_shards(4);
        let shards = ShardMap::new(store.topology().await.unwrap());
        let mut writer = ContentWriter::new(
            Arc::new(store.clone()),
            WritePlacement::Direct(shards.clone()),
            None,
            writer_config(1, 1),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        for i in 0..20 {
            writer.put(doc(&format!("/doc-{}", i))).await.unwrap();
        }
        let counters = writer.close().await;
        assert_eq!(counters.committed, 20);
        assert_eq!(store.committed_count(), 20);

        // every session went to the host serving the document's shard
        for host in store.hosts_seen() {
            assert!(host.starts_with("mem-host-"));
        }
    }

    #[tokio::test]
    async fn test_restricted_hosts_route_through_balancer() {
        let store = MemoryStore::new().with_shards(2);
        let shards = ShardMap::new(store.topology().await.unwrap());
        let balancer = Arc::new(HostBalancer::new(["proxy-a", "proxy-b"]));

        let mut writer = ContentWriter::new(
            Arc::new(store.clone()),
            WritePlacement::Direct(shards),
            Some(balancer.clone()),
            writer_config(1, 10),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        for i in 0..6 {
            writer.put(doc(&format!("/doc-{}", i))).await.unwrap();
        }
        writer.close().await;

        // shard hosts are not in the allowed set, so every session landed
        // on a proxy and the balancer accounted for each assignment
        for host in store.hosts_seen() {
            assert!(host.starts_with("proxy-"));
        }
        let total: u64 = balancer.loads().into_iter().map(|(_, l)| l).sum();
        assert_eq!(total, store.sessions_opened() as u64);
    }

    #[tokio::test]
    async fn test_shutdown_stops_retrying() {
        let store = MemoryStore::new().always_fail_inserts();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut writer = ContentWriter::new(
            Arc::new(store.clone()),
            WritePlacement::Indirect {
                entry_hosts: vec!["h1".to_string()],
            },
            None,
            WriterConfig {
                batch_size: 1,
                txn_size: 10,
                retry: fast_retry(100),
            },
            shutdown.clone(),
        )
        .unwrap();

        shutdown.store(true, Ordering::SeqCst);
        let err = writer.put(doc("/a")).await.unwrap_err();
        assert!(err.is_shutdown());

        // one in-flight attempt, no re-issue after the flag was observed
        assert_eq!(store.insert_attempts(), 1);
        let counters = writer.close().await;
        assert_eq!(counters.failed, 1);
    }
}
