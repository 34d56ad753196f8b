//! `ObjectBucket` over the `object_store` crate.
//!
//! Two backends: S3-compatible services (path-style addressing, SigV4 presigned
//! URLs) and a local directory whose "signed" URLs are `file://` URLs carrying
//! the same expiry bookkeeping.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::{Attribute, Attributes, ObjectMeta, ObjectStore, PutOptions, PutPayload};
use time::OffsetDateTime;
use url::Url;

use crate::config::{BucketConfig, S3Config};
use crate::core::{Clock, Error, Result, SystemClock};
use crate::storage::bucket::{ObjectBucket, ObjectInfo, SignedUrl};

enum Backend {
    S3(Arc<AmazonS3>),
    Local {
        store: Arc<LocalFileSystem>,
        root: PathBuf,
    },
}

pub struct RemoteBucket {
    backend: Backend,
    clock: Arc<dyn Clock>,
}

impl RemoteBucket {
    pub fn from_config(config: &BucketConfig) -> Result<Self> {
        match config {
            BucketConfig::S3(s3) => Self::s3(s3),
            BucketConfig::Local { root } => Self::local(root),
        }
    }

    pub fn s3(config: &S3Config) -> Result<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_virtual_hosted_style_request(false);
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            builder = builder
                .with_access_key_id(key_id)
                .with_secret_access_key(secret);
        }
        let store = builder.build()?;
        log::info!(
            "bucket: s3 bucket={} endpoint={}",
            config.bucket,
            config.endpoint.as_deref().unwrap_or("default")
        );
        Ok(Self {
            backend: Backend::S3(Arc::new(store)),
            clock: Arc::new(SystemClock),
        })
    }

    /// A bucket rooted at a local directory, created if missing.
    pub fn local(root: impl AsRef<FsPath>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        let store = LocalFileSystem::new_with_prefix(&root)?;
        log::info!("bucket: local root={}", root.display());
        Ok(Self {
            backend: Backend::Local {
                store: Arc::new(store),
                root,
            },
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn store(&self) -> &dyn ObjectStore {
        match &self.backend {
            Backend::S3(store) => store.as_ref(),
            Backend::Local { store, .. } => store.as_ref(),
        }
    }
}

#[async_trait]
impl ObjectBucket for RemoteBucket {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<()> {
        let location = parse_key(key)?;
        let size = data.len();
        let payload = PutPayload::from(data);
        match &self.backend {
            Backend::S3(store) => {
                let mut attributes = Attributes::new();
                attributes.insert(Attribute::ContentType, content_type.to_string().into());
                let opts = PutOptions {
                    attributes,
                    ..Default::default()
                };
                store.put_opts(&location, payload, opts).await?;
            }
            // The local backend stores no attributes.
            Backend::Local { store, .. } => {
                store.put(&location, payload).await?;
            }
        }
        log::debug!("bucket: uploaded key={key} size={size}");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let prefix = Path::from(prefix.trim_end_matches('/'));
        let metas: Vec<ObjectMeta> = self.store().list(Some(&prefix)).try_collect().await?;
        let mut objects = metas
            .into_iter()
            .map(object_info)
            .collect::<Result<Vec<_>>>()?;
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<SignedUrl> {
        let location = parse_key(key)?;
        let expires_at = self.clock.now() + ttl;
        let url = match &self.backend {
            Backend::S3(store) => store.signed_url(http::Method::GET, &location, ttl).await?,
            Backend::Local { root, .. } => {
                let path = root.join(location.as_ref());
                Url::from_file_path(&path)
                    .map_err(|_| Error::UnsupportedUrl(path.display().to_string()))?
            }
        };
        Ok(SignedUrl {
            key: key.to_string(),
            url,
            expires_at,
        })
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let locations = keys
            .iter()
            .map(|key| parse_key(key))
            .collect::<Result<Vec<_>>>()?;
        let store = self.store();
        let mut results = store.delete_stream(stream::iter(locations.into_iter().map(Ok)).boxed());
        while let Some(result) = results.next().await {
            match result {
                Ok(_) => {}
                // Already gone: the goal state holds.
                Err(object_store::Error::NotFound { path, .. }) => {
                    log::debug!("bucket: delete skipped missing key={path}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        log::info!("bucket: deleted objects={}", keys.len());
        Ok(())
    }
}

fn parse_key(key: &str) -> Result<Path> {
    Path::parse(key).map_err(|err| Error::ObjectStore(err.into()))
}

fn object_info(meta: ObjectMeta) -> Result<ObjectInfo> {
    let millis = meta.last_modified.timestamp_millis();
    let last_modified = OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)?;
    Ok(ObjectInfo {
        key: meta.location.to_string(),
        size: meta.size,
        etag: meta.e_tag,
        last_modified,
    })
}
