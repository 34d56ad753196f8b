//! Reader-facing manifest derived from the bucket listing.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;

use crate::core::Result;
use crate::layout::{parse_partition_fields, tenant_prefix, PartitionKey, PARQUET_EXTENSION};
use crate::storage::{ObjectBucket, ObjectInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
    pub partitions: BTreeMap<String, String>,
    #[serde(skip)]
    pub partition: Option<PartitionKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl From<ObjectInfo> for ManifestEntry {
    fn from(object: ObjectInfo) -> Self {
        let partitions = parse_partition_fields(&object.key);
        let partition = PartitionKey::from_object_key(&object.key);
        Self {
            key: object.key,
            size: object.size,
            etag: object.etag,
            last_modified: object.last_modified,
            partitions,
            partition,
            url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TenantManifest {
    pub tenant_id: String,
    pub items: Vec<ManifestEntry>,
}

/// Lists a tenant's Parquet objects, each with a fresh signed URL valid for
/// `ttl`.
pub async fn tenant_manifest(
    bucket: &dyn ObjectBucket,
    tenant: &str,
    ttl: Duration,
) -> Result<TenantManifest> {
    let prefix = tenant_prefix(tenant)?;
    let suffix = format!(".{PARQUET_EXTENSION}");
    let mut items = Vec::new();
    for object in bucket.list(&prefix).await? {
        if !object.key.ends_with(&suffix) {
            continue;
        }
        let signed = bucket.presign_get(&object.key, ttl).await?;
        let mut entry = ManifestEntry::from(object);
        entry.url = Some(signed.url.to_string());
        items.push(entry);
    }
    Ok(TenantManifest {
        tenant_id: tenant.to_string(),
        items,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn entry_parses_partition_from_key() {
        let entry = ManifestEntry::from(ObjectInfo {
            key: "tenant_id=t1/dt=2024-01-01/hr=09/part-a.parquet".to_string(),
            size: 10,
            etag: Some("\"abc\"".to_string()),
            last_modified: datetime!(2024-01-01 09:30 UTC),
        });
        assert_eq!(entry.partitions.get("dt").map(String::as_str), Some("2024-01-01"));
        assert_eq!(entry.partition.map(|p| p.hour), Some(9));
        assert!(entry.url.is_none());
    }

    #[test]
    fn unparseable_key_has_no_partition() {
        let entry = ManifestEntry::from(ObjectInfo {
            key: "tenant_id=t1/stray.parquet".to_string(),
            size: 10,
            etag: None,
            last_modified: datetime!(2024-01-01 09:30 UTC),
        });
        assert!(entry.partition.is_none());
        assert_eq!(entry.partitions.len(), 1);
    }
}
