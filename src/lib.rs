//! Per-tenant event staging with partitioned Parquet export and compaction.
//!
//! Events land in a local SQLite staging store. An exporter moves rows newer
//! than each tenant's watermark into Parquet objects keyed
//! `tenant_id=<t>/dt=<YYYY-MM-DD>/hr=<HH>/part-<uuid>.parquet`, and a compactor
//! merges small objects within a partition. Both run as timer-driven cycles.

pub mod columnar;
pub mod compact;
pub mod config;
pub mod core;
pub mod export;
pub mod layout;
pub mod lifecycle;
pub mod staging;
pub mod storage;

pub use crate::compact::Compactor;
pub use crate::config::{BucketConfig, PipelineConfig, S3Config};
pub use crate::core::{Error, EventRecord, Result};
pub use crate::export::Exporter;
pub use crate::lifecycle::{CycleStats, Pipeline, PipelineHandle};
pub use crate::staging::{OffsetTracker, StagingStore};
pub use crate::storage::{ObjectBucket, RemoteBucket};
