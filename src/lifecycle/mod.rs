//! Scheduling of the export and compaction cycles.
//!
//! Each job runs on its own `tokio::time::interval` loop. Ticks missed while a
//! cycle is still running are skipped rather than queued, and a [`CycleGuard`]
//! keeps manual triggers from overlapping a timer-driven cycle of the same job.
//!
//! # Example
//!
//! ```rust,ignore
//! let handle = Pipeline::start(exporter, compactor, Intervals {
//!     export: Duration::from_secs(60),
//!     compaction: Duration::from_secs(3600),
//! });
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown().await;
//! ```

mod guard;
mod pipeline;
mod stats;

pub use guard::CycleGuard;
pub use pipeline::{run_logged, spawn_loop, CycleJob, Intervals, Pipeline, PipelineHandle};
pub use stats::CycleStats;
