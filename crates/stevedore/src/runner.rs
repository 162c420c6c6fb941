//! Concurrent load runner
//!
//! Distributes independent input splits across a bounded worker pool. Each
//! worker owns one private [`ContentWriter`]; the only state shared across
//! workers is the read-only shard map, the host balancer, and the per-split
//! progress cells the monitor polls.

use crate::balancer::HostBalancer;
use crate::config::LoadConfig;
use crate::error::{LoadError, Result, WorkerStatus};
use crate::placement::ShardMap;
use crate::source::{RecordSource, SourceItem};
use crate::store::StoreConnector;
use crate::types::WriteCounters;
use crate::writer::{effective_batch_size, ContentWriter, WritePlacement, WriterConfig};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// One independent unit of input work
pub struct InputSplit {
    /// Name used in logs and the final report
    pub name: String,
    /// Size hint used for largest-first ordering
    pub size_hint: u64,
    /// The split's record reader
    pub source: Box<dyn RecordSource>,
}

impl InputSplit {
    pub fn new(name: impl Into<String>, size_hint: u64, source: Box<dyn RecordSource>) -> Self {
        Self {
            name: name.into(),
            size_hint,
            source,
        }
    }
}

/// Final outcome of one split
#[derive(Debug)]
pub struct SplitOutcome {
    pub name: String,
    pub status: WorkerStatus,
    pub counters: WriteCounters,
}

/// Aggregate result of a run
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Counters merged across all splits
    pub counters: WriteCounters,
    /// Per-split outcomes
    pub splits: Vec<SplitOutcome>,
}

impl LoadReport {
    /// Number of splits that stopped early
    pub fn splits_failed(&self) -> usize {
        self.splits
            .iter()
            .filter(|s| s.status == WorkerStatus::Failed)
            .count()
    }
}

/// Compute the worker count for each of `split_count` splits
///
/// An explicit `threads_per_split` applies uniformly. Otherwise the thread
/// budget is divided evenly with the remainder going to the first splits,
/// floored at `min_threads` and capped at `max_threads` (0 = no ceiling);
/// when even the floor oversubscribes the budget, every split gets exactly
/// `min_threads`.
pub fn allocate_threads(
    split_count: usize,
    thread_count: usize,
    threads_per_split: usize,
    min_threads: usize,
    max_threads: usize,
) -> Vec<usize> {
    if split_count == 0 {
        return Vec::new();
    }
    if threads_per_split > 0 {
        return vec![threads_per_split; split_count];
    }

    let min = min_threads.max(1);
    let cap = |n: usize| {
        if max_threads > 0 {
            n.min(max_threads.max(min))
        } else {
            n
        }
    };
    if split_count * min > thread_count {
        return vec![cap(min); split_count];
    }

    let base = thread_count / split_count;
    let extra = thread_count % split_count;
    (0..split_count)
        .map(|i| cap((base + usize::from(i < extra)).max(min)))
        .collect()
}

/// Runs splits to completion against one destination store
pub struct LoadRunner {
    connector: Arc<dyn StoreConnector>,
    config: LoadConfig,
    shutdown: Arc<AtomicBool>,
}

impl LoadRunner {
    pub fn new(connector: Arc<dyn StoreConnector>, config: LoadConfig) -> Self {
        Self {
            connector,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The process-wide shutdown flag
    ///
    /// Setting it stops workers between records, prevents retry re-issues,
    /// and ends the progress monitor. In-flight requests are not
    /// interrupted.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run every split to completion and merge the outcome counters
    ///
    /// Structural setup failures (capabilities or topology unreachable)
    /// abort the whole run. Per-split failures are recorded in the report
    /// and do not stop other splits.
    pub async fn run(&self, mut splits: Vec<InputSplit>) -> Result<LoadReport> {
        if splits.is_empty() {
            info!("no input splits, nothing to do");
            return Ok(LoadReport::default());
        }

        // startup-time store metadata; failure here is structural
        let capabilities = self.connector.capabilities().await?;
        let placement = self.resolve_placement().await?;
        let balancer = self.build_balancer();

        let writer_config = WriterConfig {
            batch_size: effective_batch_size(self.config.batch.batch_size, &capabilities),
            txn_size: self.config.batch.txn_size,
            retry: self.config.retry.clone(),
        };
        if writer_config.batch_size != self.config.batch.batch_size {
            warn!(
                configured = self.config.batch.batch_size,
                "destination does not support multi-document batches, batch size clamped to 1"
            );
        }

        splits.sort_by(|a, b| b.size_hint.cmp(&a.size_hint));
        let allocation = allocate_threads(
            splits.len(),
            self.config.workers.thread_count,
            self.config.workers.threads_per_split,
            self.config.workers.min_threads,
            self.config.workers.max_threads,
        );
        info!(
            splits = splits.len(),
            thread_count = self.config.workers.thread_count,
            allocation = ?allocation,
            "starting load"
        );

        let progress: Arc<Vec<AtomicU8>> =
            Arc::new((0..splits.len()).map(|_| AtomicU8::new(0)).collect());
        let monitor = self.spawn_progress_monitor(progress.clone());

        let outcomes = if self.config.workers.thread_count == 1 {
            self.run_sequential(splits, &writer_config, &placement, &balancer, &progress)
                .await
        } else {
            self.run_pooled(
                splits,
                allocation,
                &writer_config,
                &placement,
                &balancer,
                &progress,
            )
            .await
        };

        monitor.abort();

        let mut report = LoadReport::default();
        for outcome in outcomes {
            report.counters.merge(outcome.counters);
            report.splits.push(outcome);
        }

        info!(
            committed = report.counters.committed,
            failed = report.counters.failed,
            splits_failed = report.splits_failed(),
            "load finished"
        );
        Ok(report)
    }

    /// Strictly sequential execution on the calling task (pool size 1)
    async fn run_sequential(
        &self,
        splits: Vec<InputSplit>,
        writer_config: &WriterConfig,
        placement: &WritePlacement,
        balancer: &Option<Arc<HostBalancer>>,
        progress: &Arc<Vec<AtomicU8>>,
    ) -> Vec<SplitOutcome> {
        let mut outcomes = Vec::with_capacity(splits.len());
        for (index, split) in splits.into_iter().enumerate() {
            if self.shutdown.load(Ordering::SeqCst) {
                info!(split = %split.name, "shutdown requested, skipping remaining splits");
                outcomes.push(SplitOutcome {
                    name: split.name,
                    status: WorkerStatus::Failed,
                    counters: WriteCounters::default(),
                });
                continue;
            }
            outcomes.push(
                run_split(
                    split,
                    1,
                    self.connector.clone(),
                    placement.clone(),
                    balancer.clone(),
                    writer_config.clone(),
                    progress.clone(),
                    index,
                    self.shutdown.clone(),
                )
                .await,
            );
        }
        outcomes
    }

    /// Concurrent execution: one task per split, each with its own pool
    async fn run_pooled(
        &self,
        splits: Vec<InputSplit>,
        allocation: Vec<usize>,
        writer_config: &WriterConfig,
        placement: &WritePlacement,
        balancer: &Option<Arc<HostBalancer>>,
        progress: &Arc<Vec<AtomicU8>>,
    ) -> Vec<SplitOutcome> {
        let mut tasks = JoinSet::new();
        for (index, (split, workers)) in splits.into_iter().zip(allocation).enumerate() {
            let connector = self.connector.clone();
            let placement = placement.clone();
            let balancer = balancer.clone();
            let writer_config = writer_config.clone();
            let progress = progress.clone();
            let shutdown = self.shutdown.clone();
            tasks.spawn(async move {
                (
                    index,
                    run_split(
                        split,
                        workers,
                        connector,
                        placement,
                        balancer,
                        writer_config,
                        progress,
                        index,
                        shutdown,
                    )
                    .await,
                )
            });
        }

        let mut indexed: Vec<(usize, SplitOutcome)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => indexed.push(entry),
                Err(e) => error!(error = %e, "split task panicked"),
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, outcome)| outcome).collect()
    }

    async fn resolve_placement(&self) -> Result<WritePlacement> {
        if !self.config.store.fastload {
            return Ok(WritePlacement::Indirect {
                entry_hosts: self.config.store.hosts.clone(),
            });
        }

        let shards = if self.config.store.shards.is_empty() {
            self.connector.topology().await?
        } else {
            self.config.store.shards.clone()
        };
        if shards.is_empty() {
            return Err(LoadError::config(
                "fastload requires a shard map, none configured and none reported by the store",
            ));
        }
        info!(shards = shards.len(), "direct placement enabled");
        Ok(WritePlacement::Direct(ShardMap::new(shards)))
    }

    fn build_balancer(&self) -> Option<Arc<HostBalancer>> {
        if !self.config.store.restrict_hosts {
            return None;
        }
        let balancer = HostBalancer::new(self.config.store.allowed_hosts.iter().cloned());
        info!(hosts = balancer.len(), "restricted-host balancing enabled");
        Some(Arc::new(balancer))
    }

    /// Log average progress across all splits once per second
    fn spawn_progress_monitor(
        &self,
        progress: Arc<Vec<AtomicU8>>,
    ) -> tokio::task::JoinHandle<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await; // completes immediately
            loop {
                interval.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let sum: u32 = progress.iter().map(|p| u32::from(p.load(Ordering::Relaxed))).sum();
                let average = sum / progress.len().max(1) as u32;
                info!(percent = average, "load progress");
            }
        })
    }
}

/// Run one split with `workers` concurrent workers
///
/// Each worker owns a private writer; the reader is shared behind a mutex.
#[allow(clippy::too_many_arguments)]
async fn run_split(
    split: InputSplit,
    workers: usize,
    connector: Arc<dyn StoreConnector>,
    placement: WritePlacement,
    balancer: Option<Arc<HostBalancer>>,
    writer_config: WriterConfig,
    progress: Arc<Vec<AtomicU8>>,
    index: usize,
    shutdown: Arc<AtomicBool>,
) -> SplitOutcome {
    let name = split.name.clone();
    info!(split = %name, workers, "split started");

    let source = Arc::new(Mutex::new(split.source));
    let make_writer = || {
        ContentWriter::new(
            connector.clone(),
            placement.clone(),
            balancer.clone(),
            writer_config.clone(),
            shutdown.clone(),
        )
    };

    let (counters, status) = if workers <= 1 {
        match make_writer() {
            Ok(writer) => {
                run_worker(
                    source,
                    writer,
                    progress.clone(),
                    index,
                    shutdown.clone(),
                )
                .await
            }
            Err(e) => {
                error!(split = %name, error = %e, "failed to create writer");
                (WriteCounters::default(), WorkerStatus::Failed)
            }
        }
    } else {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            match make_writer() {
                Ok(writer) => {
                    let source = source.clone();
                    let progress = progress.clone();
                    let shutdown = shutdown.clone();
                    handles.push(tokio::spawn(async move {
                        run_worker(source, writer, progress, index, shutdown).await
                    }));
                }
                Err(e) => {
                    error!(split = %name, error = %e, "failed to create writer");
                }
            }
        }

        let mut merged = WriteCounters::default();
        let mut status = if handles.is_empty() {
            WorkerStatus::Failed
        } else {
            WorkerStatus::Completed
        };
        for joined in join_all(handles).await {
            match joined {
                Ok((counters, worker_status)) => {
                    merged.merge(counters);
                    if worker_status == WorkerStatus::Failed {
                        status = WorkerStatus::Failed;
                    }
                }
                Err(e) => {
                    error!(split = %name, error = %e, "worker task panicked");
                    status = WorkerStatus::Failed;
                }
            }
        }
        (merged, status)
    };

    info!(
        split = %name,
        committed = counters.committed,
        failed = counters.failed,
        status = %status,
        "split finished"
    );
    SplitOutcome {
        name,
        status,
        counters,
    }
}

/// Consume records from the shared reader into a private writer
async fn run_worker(
    source: Arc<Mutex<Box<dyn RecordSource>>>,
    mut writer: ContentWriter,
    progress: Arc<Vec<AtomicU8>>,
    progress_index: usize,
    shutdown: Arc<AtomicBool>,
) -> (WriteCounters, WorkerStatus) {
    let mut status = WorkerStatus::Completed;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let item = {
            let mut source = source.lock().await;
            let item = source.next().await;
            let percent = (source.progress().clamp(0.0, 1.0) * 100.0) as u8;
            progress[progress_index].store(percent, Ordering::Relaxed);
            item
        };

        match item {
            Ok(Some(SourceItem::Record(record))) => {
                if let Err(e) = writer.put(record).await {
                    if e.is_shutdown() {
                        break;
                    }
                    // the failed batch is already in the counters; keep
                    // going with the next records for this split
                    warn!(error = %e, "batch write permanently failed");
                }
            }
            Ok(Some(SourceItem::Skip { uri, reason })) => {
                writer.record_skipped(&uri, &reason);
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "record source failed");
                status = WorkerStatus::Failed;
                break;
            }
        }
    }

    let counters = writer.close().await;
    (counters, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatchConfig, LoadConfig, RetryConfig, StoreConfig, WorkerConfig};
    use crate::source::VecSource;
    use crate::store::testing::MemoryStore;
    use crate::types::{ContentKind, ContentRecord};

    fn doc(uri: &str) -> ContentRecord {
        ContentRecord::new(uri, "body", ContentKind::Text)
    }

    fn config_with(workers: WorkerConfig) -> LoadConfig {
        LoadConfig {
            store: StoreConfig {
                hosts: vec!["mem-host-0".to_string()],
                fastload: false,
                restrict_hosts: false,
                allowed_hosts: Vec::new(),
                connection_timeout_ms: 1000,
                request_timeout_ms: 1000,
                shards: Vec::new(),
            },
            batch: BatchConfig {
                batch_size: 10,
                txn_size: 2,
            },
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
                backoff_multiplier: 2.0,
            },
            workers,
            input: Default::default(),
            log_level: "info".to_string(),
        }
    }

    fn split_of(name: &str, uris: &[&str]) -> InputSplit {
        let records = uris.iter().map(|uri| doc(uri)).collect();
        InputSplit::new(name, uris.len() as u64, Box::new(VecSource::new(records)))
    }

    #[test]
    fn test_allocation_uniform_when_explicit() {
        assert_eq!(allocate_threads(3, 8, 2, 1, 0), vec![2, 2, 2]);
    }

    #[test]
    fn test_allocation_divides_with_remainder_first() {
        assert_eq!(allocate_threads(3, 4, 0, 1, 0), vec![2, 1, 1]);
        assert_eq!(allocate_threads(3, 8, 0, 1, 0), vec![3, 3, 2]);
        assert_eq!(allocate_threads(2, 7, 0, 1, 0), vec![4, 3]);
    }

    #[test]
    fn test_allocation_floors_at_min_threads() {
        assert_eq!(allocate_threads(3, 7, 0, 2, 0), vec![3, 2, 2]);
    }

    #[test]
    fn test_allocation_caps_at_max_threads() {
        assert_eq!(allocate_threads(2, 16, 0, 1, 3), vec![3, 3]);
        // ceiling never undercuts the floor
        assert_eq!(allocate_threads(2, 16, 0, 4, 2), vec![4, 4]);
    }

    #[test]
    fn test_allocation_oversubscribes_at_min() {
        // 8 splits x min 1 > 4 threads: everyone gets the floor
        assert_eq!(allocate_threads(8, 4, 0, 1, 0), vec![1; 8]);
        assert_eq!(allocate_threads(3, 4, 0, 2, 0), vec![2, 2, 2]);
    }

    #[test]
    fn test_allocation_empty() {
        assert!(allocate_threads(0, 4, 0, 1, 0).is_empty());
    }

    #[tokio::test]
    async fn test_sequential_run_loads_all_splits() {
        let store = MemoryStore::new();
        let runner = Arc::new(LoadRunner::new(
            Arc::new(store.clone()),
            config_with(WorkerConfig {
                thread_count: 1,
                threads_per_split: 0,
                min_threads: 1,
                max_threads: 0,
            }),
        ));

        let splits = vec![split_of("a", &["/a1", "/a2"]), split_of("b", &["/b1"])];
        let report = runner.run(splits).await.unwrap();

        assert_eq!(report.counters.committed, 3);
        assert_eq!(report.counters.failed, 0);
        assert_eq!(report.splits_failed(), 0);
        assert_eq!(store.committed_count(), 3);
    }

    #[tokio::test]
    async fn test_pooled_run_loads_all_splits() {
        let store = MemoryStore::new();
        let runner = LoadRunner::new(
            Arc::new(store.clone()),
            config_with(WorkerConfig {
                thread_count: 4,
                threads_per_split: 0,
                min_threads: 1,
                max_threads: 0,
            }),
        );

        let splits = vec![
            split_of("a", &["/a1", "/a2", "/a3"]),
            split_of("b", &["/b1", "/b2"]),
            split_of("c", &["/c1"]),
        ];
        let report = runner.run(splits).await.unwrap();

        assert_eq!(report.counters.committed, 6);
        assert_eq!(report.splits.len(), 3);
        assert_eq!(store.committed_count(), 6);
    }

    #[tokio::test]
    async fn test_reader_failure_fails_only_its_split() {
        struct FailingSource;

        #[async_trait::async_trait]
        impl RecordSource for FailingSource {
            async fn next(&mut self) -> crate::error::Result<Option<SourceItem>> {
                Err(LoadError::source("broken", "cannot decode input"))
            }
            fn progress(&self) -> f32 {
                0.0
            }
        }

        let store = MemoryStore::new();
        let runner = LoadRunner::new(
            Arc::new(store.clone()),
            config_with(WorkerConfig {
                thread_count: 1,
                threads_per_split: 0,
                min_threads: 1,
                max_threads: 0,
            }),
        );

        let splits = vec![
            InputSplit::new("broken", 10, Box::new(FailingSource)),
            split_of("ok", &["/ok"]),
        ];
        let report = runner.run(splits).await.unwrap();

        assert_eq!(report.splits_failed(), 1);
        assert_eq!(report.counters.committed, 1);
        assert_eq!(store.committed_uris(), vec!["/ok"]);
    }

    #[tokio::test]
    async fn test_structural_failure_aborts_run() {
        let store = MemoryStore::new();
        let mut config = config_with(WorkerConfig {
            thread_count: 1,
            threads_per_split: 0,
            min_threads: 1,
            max_threads: 0,
        });
        // fastload with no shard map: MemoryStore topology works, so force
        // the failure by emptying both sources of shards
        config.store.fastload = true;
        let runner = LoadRunner::new(Arc::new(EmptyTopology(store)), config);

        let err = runner.run(vec![split_of("a", &["/a"])]).await.unwrap_err();
        assert!(err.to_string().contains("shard map"));
    }

    struct EmptyTopology(MemoryStore);

    #[async_trait::async_trait]
    impl StoreConnector for EmptyTopology {
        async fn capabilities(&self) -> crate::error::Result<crate::store::StoreCapabilities> {
            self.0.capabilities().await
        }
        async fn topology(&self) -> crate::error::Result<Vec<crate::placement::ShardRef>> {
            Ok(Vec::new())
        }
        async fn connect(
            &self,
            host: &str,
            shard: Option<&crate::placement::ShardRef>,
        ) -> crate::error::Result<Box<dyn crate::store::StoreSession>> {
            self.0.connect(host, shard).await
        }
    }

    #[tokio::test]
    async fn test_inner_pool_drains_shared_source() {
        let store = MemoryStore::new();
        let runner = LoadRunner::new(
            Arc::new(store.clone()),
            config_with(WorkerConfig {
                thread_count: 4,
                threads_per_split: 4,
                min_threads: 1,
                max_threads: 0,
            }),
        );

        let uris: Vec<String> = (0..40).map(|i| format!("/doc-{}", i)).collect();
        let uri_refs: Vec<&str> = uris.iter().map(String::as_str).collect();
        let report = runner.run(vec![split_of("big", &uri_refs)]).await.unwrap();

        assert_eq!(report.counters.committed, 40);
        assert_eq!(store.committed_count(), 40);
    }
}
