//! In-memory store backend for tests
//!
//! [`MemoryStore`] implements the store traits without any network, with
//! builder-style failure injection for exercising the retry and rollback
//! paths. Committed documents become visible only after `commit`; a
//! rollback discards everything staged since the last commit boundary.

use super::{BatchOutcome, StoreCapabilities, StoreConnector, StoreSession};
use crate::error::{LoadError, Result};
use crate::placement::ShardRef;
use crate::types::ContentRecord;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct MemoryInner {
    shards: Vec<ShardRef>,
    capabilities: StoreCapabilities,
    committed: Mutex<HashMap<String, Bytes>>,
    rejected: Mutex<HashSet<String>>,
    insert_attempts: AtomicU32,
    fail_first_inserts: AtomicU32,
    fail_inserts_after: AtomicU32,
    commit_count: AtomicU32,
    fail_first_commits: AtomicU32,
    rollback_count: AtomicU32,
    sessions_opened: AtomicU32,
    hosts_seen: Mutex<Vec<String>>,
}

/// In-memory implementation of [`StoreConnector`]
///
/// Cheap to clone; every clone shares the same state so a test can keep a
/// handle while the pipeline owns another.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store with a single shard and full batching support
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                shards: vec![ShardRef::new("mem-0", vec!["mem-host-0".to_string()])],
                capabilities: StoreCapabilities::default(),
                committed: Mutex::new(HashMap::new()),
                rejected: Mutex::new(HashSet::new()),
                insert_attempts: AtomicU32::new(0),
                fail_first_inserts: AtomicU32::new(0),
                fail_inserts_after: AtomicU32::new(u32::MAX),
                commit_count: AtomicU32::new(0),
                fail_first_commits: AtomicU32::new(0),
                rollback_count: AtomicU32::new(0),
                sessions_opened: AtomicU32::new(0),
                hosts_seen: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Use `n` shards named `mem-{i}`, each served by `mem-host-{i}`
    pub fn with_shards(self, n: usize) -> Self {
        let shards = (0..n)
            .map(|i| ShardRef::new(format!("mem-{}", i), vec![format!("mem-host-{}", i)]))
            .collect();
        self.rebuild(|inner| MemoryInner {
            shards,
            ..inner
        })
    }

    /// Override the advertised capabilities
    pub fn with_capabilities(self, capabilities: StoreCapabilities) -> Self {
        self.rebuild(|inner| MemoryInner {
            capabilities,
            ..inner
        })
    }

    /// Fail the first `n` batch submissions with a connection error
    pub fn fail_first_inserts(self, n: u32) -> Self {
        self.inner.fail_first_inserts.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every batch submission
    pub fn always_fail_inserts(self) -> Self {
        self.fail_first_inserts(u32::MAX)
    }

    /// Accept the first `n` batch submissions, fail everything after
    pub fn fail_inserts_after(self, n: u32) -> Self {
        self.inner.fail_inserts_after.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the first `n` commits with a connection error
    pub fn fail_first_commits(self, n: u32) -> Self {
        self.inner.fail_first_commits.store(n, Ordering::SeqCst);
        self
    }

    /// Reject the given URIs individually inside otherwise accepted batches
    pub fn reject_uris<I, S>(self, uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut rejected = self.inner.rejected.lock();
            for uri in uris {
                rejected.insert(uri.into());
            }
        }
        self
    }

    fn rebuild(self, f: impl FnOnce(MemoryInner) -> MemoryInner) -> Self {
        // Builder methods run before any session exists, so the Arc is
        // still unique here.
        let inner = Arc::try_unwrap(self.inner)
            .unwrap_or_else(|_| panic!("MemoryStore builder used after sessions were opened"));
        Self {
            inner: Arc::new(f(inner)),
        }
    }

    /// URIs committed so far, sorted
    pub fn committed_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.inner.committed.lock().keys().cloned().collect();
        uris.sort();
        uris
    }

    /// Committed document count
    pub fn committed_count(&self) -> usize {
        self.inner.committed.lock().len()
    }

    /// Committed body for a URI
    pub fn committed_body(&self, uri: &str) -> Option<Bytes> {
        self.inner.committed.lock().get(uri).cloned()
    }

    /// Total `insert_batch` attempts, including failed ones
    pub fn insert_attempts(&self) -> u32 {
        self.inner.insert_attempts.load(Ordering::SeqCst)
    }

    /// Successful commit count
    pub fn commit_count(&self) -> u32 {
        self.inner.commit_count.load(Ordering::SeqCst)
    }

    /// Rollback count
    pub fn rollback_count(&self) -> u32 {
        self.inner.rollback_count.load(Ordering::SeqCst)
    }

    /// Sessions opened over the store's lifetime
    pub fn sessions_opened(&self) -> u32 {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    /// Hosts that sessions were opened against, in order
    pub fn hosts_seen(&self) -> Vec<String> {
        self.inner.hosts_seen.lock().clone()
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn capabilities(&self) -> Result<StoreCapabilities> {
        Ok(self.inner.capabilities)
    }

    async fn topology(&self) -> Result<Vec<ShardRef>> {
        Ok(self.inner.shards.clone())
    }

    async fn connect(
        &self,
        host: &str,
        _shard: Option<&ShardRef>,
    ) -> Result<Box<dyn StoreSession>> {
        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);
        self.inner.hosts_seen.lock().push(host.to_string());
        Ok(Box::new(MemorySession {
            inner: self.inner.clone(),
            staged: Vec::new(),
        }))
    }
}

struct MemorySession {
    inner: Arc<MemoryInner>,
    staged: Vec<(String, Bytes)>,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn insert_batch(&mut self, docs: &[ContentRecord]) -> Result<BatchOutcome> {
        let attempt = self.inner.insert_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.inner.fail_first_inserts.load(Ordering::SeqCst)
            || attempt > self.inner.fail_inserts_after.load(Ordering::SeqCst)
        {
            return Err(LoadError::connection("injected insert failure"));
        }

        let mut outcome = BatchOutcome::default();
        let rejected = self.inner.rejected.lock();
        for doc in docs {
            if rejected.contains(&doc.uri) {
                outcome.reject(doc.uri.clone(), "rejected by store");
            } else {
                self.staged.push((doc.uri.clone(), doc.body.clone()));
                outcome.accepted += 1;
            }
        }
        Ok(outcome)
    }

    async fn commit(&mut self) -> Result<()> {
        let remaining = self.inner.fail_first_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .fail_first_commits
                .store(remaining - 1, Ordering::SeqCst);
            return Err(LoadError::connection("injected commit failure"));
        }

        let mut committed = self.inner.committed.lock();
        for (uri, body) in self.staged.drain(..) {
            committed.insert(uri, body);
        }
        self.inner.commit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.staged.clear();
        self.inner.rollback_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentKind;

    fn doc(uri: &str) -> ContentRecord {
        ContentRecord::new(uri, "body", ContentKind::Text)
    }

    #[tokio::test]
    async fn test_commit_makes_documents_visible() {
        let store = MemoryStore::new();
        let mut session = store.connect("mem-host-0", None).await.unwrap();

        let outcome = session.insert_batch(&[doc("/a"), doc("/b")]).await.unwrap();
        assert_eq!(outcome.accepted, 2);
        assert_eq!(store.committed_count(), 0);

        session.commit().await.unwrap();
        assert_eq!(store.committed_uris(), vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn test_rollback_discards_staged() {
        let store = MemoryStore::new();
        let mut session = store.connect("mem-host-0", None).await.unwrap();

        session.insert_batch(&[doc("/a")]).await.unwrap();
        session.rollback().await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(store.committed_count(), 0);
        assert_eq!(store.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_fail_first_inserts_then_recovers() {
        let store = MemoryStore::new().fail_first_inserts(2);
        let mut session = store.connect("mem-host-0", None).await.unwrap();

        assert!(session.insert_batch(&[doc("/a")]).await.is_err());
        assert!(session.insert_batch(&[doc("/a")]).await.is_err());
        assert!(session.insert_batch(&[doc("/a")]).await.is_ok());
        assert_eq!(store.insert_attempts(), 3);
    }

    #[tokio::test]
    async fn test_rejected_uris_are_reported_not_staged() {
        let store = MemoryStore::new().reject_uris(["/bad"]);
        let mut session = store.connect("mem-host-0", None).await.unwrap();

        let outcome = session
            .insert_batch(&[doc("/good"), doc("/bad")])
            .await
            .unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.rejected.len(), 1);

        session.commit().await.unwrap();
        assert_eq!(store.committed_uris(), vec!["/good"]);
    }
}
