use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use url::Url;

use crate::core::Result;

pub const PARQUET_CONTENT_TYPE: &str = "application/octet-stream";

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: OffsetDateTime,
}

/// A time-limited read URL for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub key: String,
    pub url: Url,
    pub expires_at: OffsetDateTime,
}

impl SignedUrl {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

/// The subset of object storage the pipeline relies on.
///
/// Listing must observe puts made earlier by the same process.
#[async_trait]
pub trait ObjectBucket: Send + Sync {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()>;

    /// Every object whose key starts with `prefix`, following pagination.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<SignedUrl>;

    /// Deletes `keys` in a single batch request where the backend supports it.
    async fn delete_many(&self, keys: &[String]) -> Result<()>;
}
