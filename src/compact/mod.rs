//! Merging of small Parquet files within a partition.
//!
//! Per tenant and partition, small objects are read through signed URLs,
//! rewritten as one `part-compact-<uuid>.parquet` in the same partition, and
//! deleted only after the merged object is uploaded. A failure at any step
//! leaves the originals in place; at worst both copies exist until the next
//! cycle.

pub mod plan;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use crate::columnar::{write_events_file, UrlReader};
use crate::config::PipelineConfig;
use crate::core::{Clock, Error};
use crate::layout::{compacted_file_name, object_key, tenant_prefix};
use crate::lifecycle::{CycleGuard, CycleJob, CycleStats};
use crate::staging::StagingStore;
use crate::storage::{ObjectBucket, PARQUET_CONTENT_TYPE};

pub use plan::{group_by_partition, select_candidates, MergeCandidate, PartitionGroup};

/// Outcome of one merged partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCompaction {
    pub key: String,
    pub rows: u64,
    pub bytes: u64,
    pub deleted: Vec<String>,
}

pub struct Compactor {
    store: Arc<StagingStore>,
    bucket: Arc<dyn ObjectBucket>,
    reader: UrlReader,
    target_file_bytes: u64,
    presign_ttl: Duration,
    compression_level: i32,
    scratch_dir: Option<PathBuf>,
    guard: CycleGuard,
}

impl Compactor {
    pub fn new(
        store: Arc<StagingStore>,
        bucket: Arc<dyn ObjectBucket>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            store,
            bucket,
            reader: UrlReader::new(),
            target_file_bytes: config.target_file_bytes,
            presign_ttl: config.presign_ttl,
            compression_level: config.compression_level,
            scratch_dir: config.scratch_dir.clone(),
            guard: CycleGuard::new(),
        }
    }

    /// Replaces the clock used to check signed URL expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.reader = UrlReader::new().with_clock(clock);
        self
    }

    pub fn guard(&self) -> CycleGuard {
        self.guard.clone()
    }

    /// Compacts every tenant once. Tenants are those with staged rows or a
    /// watermark, so purged tenants are still visited.
    pub async fn run_once(&self) -> Result<CycleStats> {
        let Some(_permit) = self.guard.try_enter() else {
            return Ok(CycleStats::skipped());
        };
        let started = Instant::now();
        let mut stats = CycleStats::new();

        let store = Arc::clone(&self.store);
        let tenants = tokio::task::spawn_blocking(move || -> Result<BTreeSet<String>> {
            let mut tenants: BTreeSet<String> = store.distinct_tenants()?.into_iter().collect();
            tenants.extend(store.offsets().all()?.into_iter().map(|(tenant, _)| tenant));
            Ok(tenants)
        })
        .await
        .context("join tenant listing")?
        .context("list tenants")?;

        for tenant in tenants {
            stats.tenants_scanned += 1;
            if let Err(err) = self.compact_tenant(&tenant, &mut stats).await {
                log::error!("compact: tenant={tenant} failed: {err:#}");
                stats.record_error(format!("tenant={tenant}: {err:#}"));
            }
        }

        stats.duration = started.elapsed();
        Ok(stats)
    }

    /// Merges every eligible partition of one tenant. Group failures are
    /// recorded in `stats` and do not stop the remaining groups.
    pub async fn compact_tenant(&self, tenant: &str, stats: &mut CycleStats) -> Result<()> {
        let prefix = tenant_prefix(tenant)?;
        let objects = self
            .bucket
            .list(&prefix)
            .await
            .with_context(|| format!("list {prefix}"))?;
        if objects.is_empty() {
            log::debug!("compact: tenant={tenant} has no objects");
            return Ok(());
        }

        let candidates = select_candidates(objects, self.target_file_bytes);
        let mut changed = false;
        for candidate in candidates {
            let partition = candidate.partition;
            match self.compact_group(tenant, &candidate).await {
                Ok(done) => {
                    log::info!(
                        "compact: tenant={tenant} {partition} merged={} rows={} into key={}",
                        done.deleted.len(),
                        done.rows,
                        done.key
                    );
                    changed = true;
                    stats.rows_written += done.rows;
                    stats.objects_written += 1;
                    stats.objects_deleted += done.deleted.len();
                }
                Err(err) => {
                    log::error!("compact: tenant={tenant} {partition} failed: {err:#}");
                    stats.record_error(format!("tenant={tenant} {partition}: {err:#}"));
                }
            }
        }
        if changed {
            stats.tenants_changed += 1;
        }
        Ok(())
    }

    /// Merges one candidate. The originals are deleted only after the merged
    /// file is uploaded.
    pub async fn compact_group(
        &self,
        tenant: &str,
        candidate: &MergeCandidate,
    ) -> Result<GroupCompaction> {
        let mut urls = Vec::with_capacity(candidate.small.len());
        for object in &candidate.small {
            let signed = self
                .bucket
                .presign_get(&object.key, self.presign_ttl)
                .await
                .with_context(|| format!("presign {}", object.key))?;
            urls.push(signed);
        }

        let scratch = self.scratch()?;
        let filename = compacted_file_name();
        let path = scratch.path().join(&filename);
        let level = self.compression_level;

        let merge = async {
            let mut rows = self.reader.read_rows_from_urls(&urls).await?;
            rows.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.event_id.cmp(&b.event_id)));
            let out = path.clone();
            let summary = tokio::task::spawn_blocking(move || write_events_file(&out, &rows, level))
                .await
                .map_err(|err| Error::Io(std::io::Error::other(err)))??;
            Ok::<_, Error>(summary)
        };
        let summary = tokio::time::timeout(self.presign_ttl, merge)
            .await
            .map_err(|_| anyhow!("merge exceeded signed url lifetime {:?}", self.presign_ttl))?
            .context("merge small files")?;
        if summary.rows == 0 {
            return Err(anyhow!("merge of {} files produced no rows", urls.len()));
        }

        let key = object_key(tenant, &candidate.partition, &filename)?;
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read scratch file {}", path.display()))?;
        self.bucket
            .put(&key, Bytes::from(data), PARQUET_CONTENT_TYPE)
            .await
            .with_context(|| format!("upload {key}"))?;

        let deleted = candidate.keys();
        self.bucket
            .delete_many(&deleted)
            .await
            .with_context(|| format!("delete {} merged originals", deleted.len()))?;

        Ok(GroupCompaction {
            key,
            rows: summary.rows as u64,
            bytes: summary.bytes,
            deleted,
        })
    }

    fn scratch(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("eventlake-compact-");
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
impl CycleJob for Compactor {
    fn name(&self) -> &'static str {
        "compact"
    }

    async fn run_cycle(&self) -> Result<CycleStats> {
        self.run_once().await
    }
}
