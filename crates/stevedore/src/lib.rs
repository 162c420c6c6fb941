//! stevedore - bulk content loader for sharded document stores
//!
//! Streams (URI, document, metadata) records from filesystem sources into
//! store shards with batching, per-session transactions, bounded retries,
//! and host load balancing under restricted connectivity.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐    ┌────────────────────────────────┐    ┌───────────────┐
//! │  Source  │───▶│  ContentWriter (per worker)    │───▶│  Store shard  │
//! │ (files)  │    │  placement → batch → txn/retry │    │  (session)    │
//! └──────────┘    └────────────────────────────────┘    └───────────────┘
//! ```
//!
//! The [`runner::LoadRunner`] distributes input splits across a bounded
//! worker pool; every worker owns a private [`writer::ContentWriter`], so
//! the only cross-task state is the read-only shard map and the
//! [`balancer::HostBalancer`] load table.
//!
//! # Library usage
//!
//! ```rust,ignore
//! use stevedore::prelude::*;
//!
//! let connector = Arc::new(HttpStoreConnector::new(&config.store)?);
//! let runner = LoadRunner::new(connector, config);
//! let report = runner.run(splits).await?;
//! println!("committed {} failed {}", report.counters.committed, report.counters.failed);
//! ```
//!
//! # CLI usage
//!
//! ```bash
//! # Load everything under input.path from load.yaml
//! stevedore -c load.yaml
//!
//! # Validate configuration
//! stevedore -c load.yaml validate
//!
//! # Check connectivity and shard topology
//! stevedore -c load.yaml check
//! ```

pub mod balancer;
pub mod config;
pub mod error;
pub mod placement;
pub mod runner;
pub mod source;
pub mod store;
pub mod types;
pub mod writer;

// Re-export the main surface at the crate root
pub use balancer::HostBalancer;
pub use config::{BatchConfig, LoadConfig, RetryConfig, StoreConfig, WorkerConfig};
pub use error::{LoadError, Result, WorkerStatus};
pub use placement::{ShardMap, ShardRef};
pub use runner::{allocate_threads, InputSplit, LoadReport, LoadRunner, SplitOutcome};
pub use source::{collect_files, plan_splits, DirectorySource, RecordSource, SourceItem, VecSource};
pub use store::http::HttpStoreConnector;
pub use store::{BatchOutcome, RejectedDocument, StoreCapabilities, StoreConnector, StoreSession};
pub use types::{Capability, ContentKind, ContentRecord, DocumentMetadata, Permission, WriteCounters};
pub use writer::{effective_batch_size, ContentWriter, WritePlacement, WriterConfig};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        allocate_threads,
        collect_files,
        effective_batch_size,
        plan_splits,
        BatchOutcome,
        Capability,
        ContentKind,
        ContentRecord,
        ContentWriter,
        DirectorySource,
        DocumentMetadata,
        HostBalancer,
        HttpStoreConnector,
        InputSplit,
        LoadConfig,
        LoadError,
        LoadReport,
        LoadRunner,
        Permission,
        RecordSource,
        Result,
        RetryConfig,
        ShardMap,
        ShardRef,
        SourceItem,
        SplitOutcome,
        StoreCapabilities,
        StoreConnector,
        StoreSession,
        VecSource,
        WorkerStatus,
        WriteCounters,
        WritePlacement,
        WriterConfig,
    };
}
