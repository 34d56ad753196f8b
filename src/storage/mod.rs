//! Object storage for exported files.

mod bucket;
pub mod manifest;
mod remote;

pub use bucket::{ObjectBucket, ObjectInfo, SignedUrl, PARQUET_CONTENT_TYPE};
pub use manifest::{tenant_manifest, ManifestEntry, TenantManifest};
pub use remote::RemoteBucket;
