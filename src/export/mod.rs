//! Incremental export of staged events to partitioned Parquet objects.
//!
//! For every tenant the exporter reads rows newer than the tenant's watermark,
//! writes one Parquet file per `(date, hour)` partition touched, uploads them,
//! and only then moves the watermark to the newest exported timestamp. A crash
//! or failed upload before that last step leaves the watermark where it was,
//! so the next cycle exports an overlapping superset of the same rows.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use time::OffsetDateTime;

use crate::columnar::write_events_file;
use crate::config::PipelineConfig;
use crate::core::EventRecord;
use crate::layout::{export_file_name, object_key, PartitionKey};
use crate::lifecycle::{CycleGuard, CycleJob, CycleStats};
use crate::staging::StagingStore;
use crate::storage::{ObjectBucket, PARQUET_CONTENT_TYPE};

/// Outcome of one tenant's export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantExport {
    pub tenant: String,
    pub rows: u64,
    pub objects: Vec<String>,
    /// Watermark after the export.
    pub watermark: OffsetDateTime,
}

/// A partition file written to scratch and waiting for upload.
#[derive(Debug)]
struct StagedFile {
    key: String,
    path: PathBuf,
    rows: usize,
    max_ts: OffsetDateTime,
}

pub struct Exporter {
    store: Arc<StagingStore>,
    bucket: Arc<dyn ObjectBucket>,
    compression_level: i32,
    scratch_dir: Option<PathBuf>,
    guard: CycleGuard,
}

impl Exporter {
    pub fn new(
        store: Arc<StagingStore>,
        bucket: Arc<dyn ObjectBucket>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            bucket,
            compression_level: config.compression_level,
            scratch_dir: config.scratch_dir.clone(),
            guard: CycleGuard::new(),
        }
    }

    /// The guard serializing this exporter's cycles.
    pub fn guard(&self) -> CycleGuard {
        self.guard.clone()
    }

    /// Exports every tenant once. A failing tenant is logged and counted; the
    /// others still run. Returns a skipped result if a cycle is in flight.
    pub async fn run_once(&self) -> Result<CycleStats> {
        let Some(_permit) = self.guard.try_enter() else {
            return Ok(CycleStats::skipped());
        };
        let started = Instant::now();
        let mut stats = CycleStats::new();

        let store = Arc::clone(&self.store);
        let tenants = tokio::task::spawn_blocking(move || store.distinct_tenants())
            .await
            .context("join tenant listing")?
            .context("list staged tenants")?;

        for tenant in tenants {
            stats.tenants_scanned += 1;
            match self.export_tenant(&tenant).await {
                Ok(Some(export)) => {
                    stats.tenants_changed += 1;
                    stats.rows_written += export.rows;
                    stats.objects_written += export.objects.len();
                }
                Ok(None) => {}
                Err(err) => {
                    log::error!("export: tenant={tenant} failed: {err:#}");
                    stats.record_error(format!("tenant={tenant}: {err:#}"));
                }
            }
        }

        stats.duration = started.elapsed();
        Ok(stats)
    }

    /// Exports one tenant's rows newer than its watermark. `None` when nothing
    /// is pending.
    pub async fn export_tenant(&self, tenant: &str) -> Result<Option<TenantExport>> {
        let scratch = self.scratch()?;
        let store = Arc::clone(&self.store);
        let owned_tenant = tenant.to_string();
        let dir = scratch.path().to_path_buf();
        let level = self.compression_level;

        let (watermark, files) = tokio::task::spawn_blocking(move || -> Result<_> {
            let watermark = store.offsets().get(&owned_tenant)?;
            let rows = store
                .scan_since(&owned_tenant, watermark)
                .context("scan staged rows")?;
            if rows.is_empty() {
                return Ok((watermark, Vec::new()));
            }
            let files = write_partition_files(&dir, &owned_tenant, &rows, level)?;
            Ok((watermark, files))
        })
        .await
        .context("join export writer")??;

        let Some(max_ts) = files.iter().map(|file| file.max_ts).max() else {
            log::debug!("export: tenant={tenant} nothing newer than {watermark}");
            return Ok(None);
        };

        let mut objects = Vec::with_capacity(files.len());
        let mut rows = 0u64;
        for file in &files {
            let data = tokio::fs::read(&file.path)
                .await
                .with_context(|| format!("read scratch file {}", file.path.display()))?;
            self.bucket
                .put(&file.key, Bytes::from(data), PARQUET_CONTENT_TYPE)
                .await
                .with_context(|| format!("upload {}", file.key))?;
            log::info!(
                "export: tenant={tenant} uploaded key={} rows={}",
                file.key,
                file.rows
            );
            objects.push(file.key.clone());
            rows += file.rows as u64;
        }

        let store = Arc::clone(&self.store);
        let owned_tenant = tenant.to_string();
        let stored =
            tokio::task::spawn_blocking(move || store.offsets().advance(&owned_tenant, max_ts))
                .await
                .context("join watermark update")?
                .context("advance watermark")?;
        if stored > max_ts {
            log::warn!(
                "export: tenant={tenant} watermark already at {stored}, kept over {max_ts}"
            );
        } else {
            log::info!("export: tenant={tenant} watermark {watermark} -> {max_ts}");
        }

        Ok(Some(TenantExport {
            tenant: tenant.to_string(),
            rows,
            objects,
            watermark: stored,
        }))
    }

    fn scratch(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("eventlake-export-");
        let dir = match &self.scratch_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create scratch dir {}", parent.display()))?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

#[async_trait]
impl CycleJob for Exporter {
    fn name(&self) -> &'static str {
        "export"
    }

    async fn run_cycle(&self) -> Result<CycleStats> {
        self.run_once().await
    }
}

/// Writes ascending `rows` as one file per run of rows sharing a partition.
fn write_partition_files(
    dir: &Path,
    tenant: &str,
    rows: &[EventRecord],
    level: i32,
) -> Result<Vec<StagedFile>> {
    let mut files = Vec::new();
    for run in partition_runs(rows) {
        let filename = export_file_name();
        let path = dir.join(&filename);
        let summary = write_events_file(&path, run, level)
            .with_context(|| format!("write {}", path.display()))?;
        let Some(max_ts) = summary.max_ts else {
            continue;
        };
        let partition = PartitionKey::from_timestamp(max_ts);
        files.push(StagedFile {
            key: object_key(tenant, &partition, &filename)?,
            path,
            rows: summary.rows,
            max_ts,
        });
    }
    Ok(files)
}

/// Splits `rows` into maximal consecutive slices with the same partition.
fn partition_runs(rows: &[EventRecord]) -> Vec<&[EventRecord]> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=rows.len() {
        let boundary = i == rows.len()
            || PartitionKey::from_timestamp(rows[i].ts)
                != PartitionKey::from_timestamp(rows[start].ts);
        if boundary {
            runs.push(&rows[start..i]);
            start = i;
        }
    }
    runs
}
