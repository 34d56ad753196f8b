//! Pipeline configuration.
//!
//! Built by the binary from flags and environment variables, and validated
//! once at startup. Nothing here reads the environment directly.

use std::path::PathBuf;
use std::time::Duration;

use crate::columnar::DEFAULT_ZSTD_LEVEL;
use crate::core::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Connection settings for an S3-compatible bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Custom endpoint (R2, MinIO). `None` uses the AWS default.
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            region: "auto".to_string(),
            bucket: bucket.into(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

/// Where exported files are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketConfig {
    S3(S3Config),
    /// A local directory, for development and tests.
    Local { root: PathBuf },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// SQLite file holding staged events and watermarks.
    pub staging_path: PathBuf,
    pub bucket: BucketConfig,
    /// Lifetime of signed read URLs, and the bound on one compaction merge.
    pub presign_ttl: Duration,
    pub export_interval: Duration,
    pub compaction_interval: Duration,
    /// Compaction target size in bytes.
    pub target_file_bytes: u64,
    /// Zstd level for Parquet pages (1-22).
    pub compression_level: i32,
    /// Parent of per-cycle scratch directories. `None` uses the system temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn new(staging_path: impl Into<PathBuf>, bucket: BucketConfig) -> Self {
        Self {
            staging_path: staging_path.into(),
            bucket,
            presign_ttl: Duration::from_secs(900),
            export_interval: Duration::from_secs(60),
            compaction_interval: Duration::from_secs(3600),
            target_file_bytes: 128 * MIB,
            compression_level: DEFAULT_ZSTD_LEVEL,
            scratch_dir: None,
        }
    }

    pub fn with_target_mb(mut self, mb: u64) -> Self {
        self.target_file_bytes = mb.saturating_mul(MIB);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match &self.bucket {
            BucketConfig::S3(s3) => {
                if s3.bucket.trim().is_empty() {
                    return Err(Error::Config("bucket name is empty".to_string()));
                }
                if s3.region.trim().is_empty() {
                    return Err(Error::Config("region is empty".to_string()));
                }
                if s3.access_key_id.is_some() != s3.secret_access_key.is_some() {
                    return Err(Error::Config(
                        "access key id and secret access key must be set together".to_string(),
                    ));
                }
            }
            BucketConfig::Local { root } => {
                if root.as_os_str().is_empty() {
                    return Err(Error::Config("local bucket root is empty".to_string()));
                }
            }
        }
        if self.target_file_bytes == 0 {
            return Err(Error::Config("target file size must be positive".to_string()));
        }
        if self.presign_ttl.is_zero() {
            return Err(Error::Config("presign ttl must be positive".to_string()));
        }
        if self.export_interval.is_zero() || self.compaction_interval.is_zero() {
            return Err(Error::Config("cycle intervals must be positive".to_string()));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(Error::Config(format!(
                "zstd level {} outside 1..=22",
                self.compression_level
            )));
        }
        Ok(())
    }
}
