#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio::sync::{Notify, Semaphore};

use eventlake::columnar::read_events;
use eventlake::storage::{ObjectInfo, SignedUrl};
use eventlake::{
    BucketConfig, EventRecord, ObjectBucket, PipelineConfig, RemoteBucket, StagingStore,
};

pub struct Fixture {
    pub temp: TempDir,
    pub store: Arc<StagingStore>,
    pub bucket: Arc<RemoteBucket>,
    pub config: PipelineConfig,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let root = temp.path().join("bucket");
        let store = Arc::new(StagingStore::open(temp.path().join("staging.sqlite3"))?);
        let bucket = Arc::new(RemoteBucket::local(&root)?);
        let mut config = PipelineConfig::new(
            temp.path().join("staging.sqlite3"),
            BucketConfig::Local { root },
        );
        config.scratch_dir = Some(temp.path().join("scratch"));
        config.presign_ttl = Duration::from_secs(60);
        Ok(Self {
            temp,
            store,
            bucket,
            config,
        })
    }

    pub fn dyn_bucket(&self) -> Arc<dyn ObjectBucket> {
        self.bucket.clone()
    }

    /// Every row stored in the tenant's objects, by event id.
    pub async fn exported_ids(&self, tenant: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .exported_rows(tenant)
            .await?
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub async fn exported_rows(&self, tenant: &str) -> Result<Vec<EventRecord>> {
        let root = self.temp.path().join("bucket");
        let mut rows = Vec::new();
        for object in self.bucket.list(&format!("tenant_id={tenant}/")).await? {
            let data = std::fs::read(root.join(&object.key))?;
            rows.extend(read_events(Bytes::from(data))?);
        }
        Ok(rows)
    }

    pub fn scratch_is_empty(&self) -> bool {
        let scratch = self.temp.path().join("scratch");
        match std::fs::read_dir(&scratch) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => true,
        }
    }
}

pub fn event(tenant: &str, id: &str, ts: OffsetDateTime) -> EventRecord {
    EventRecord::new(tenant, id, ts).with_type("page_view")
}

/// Wraps a bucket and fails selected operations on demand.
pub struct FailingBucket {
    inner: Arc<dyn ObjectBucket>,
    pub fail_puts: AtomicBool,
    /// Fail only puts after this many succeeded.
    pub puts_before_failure: AtomicUsize,
    pub fail_deletes: AtomicBool,
    pub puts: AtomicUsize,
}

impl FailingBucket {
    pub fn new(inner: Arc<dyn ObjectBucket>) -> Self {
        Self {
            inner,
            fail_puts: AtomicBool::new(false),
            puts_before_failure: AtomicUsize::new(0),
            fail_deletes: AtomicBool::new(false),
            puts: AtomicUsize::new(0),
        }
    }
}

fn injected(what: &str) -> eventlake::Error {
    eventlake::Error::Io(std::io::Error::other(format!("injected {what} failure")))
}

#[async_trait]
impl ObjectBucket for FailingBucket {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> eventlake::Result<()> {
        if self.fail_puts.load(Ordering::SeqCst)
            && self.puts.load(Ordering::SeqCst) >= self.puts_before_failure.load(Ordering::SeqCst)
        {
            return Err(injected("put"));
        }
        self.inner.put(key, data, content_type).await?;
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> eventlake::Result<Vec<ObjectInfo>> {
        self.inner.list(prefix).await
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> eventlake::Result<SignedUrl> {
        self.inner.presign_get(key, ttl).await
    }

    async fn delete_many(&self, keys: &[String]) -> eventlake::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(injected("delete"));
        }
        self.inner.delete_many(keys).await
    }
}

/// Holds the first `put` until [`GatedBucket::release`] is called.
pub struct GatedBucket {
    inner: Arc<dyn ObjectBucket>,
    armed: AtomicBool,
    pub entered: Notify,
    gate: Semaphore,
}

impl GatedBucket {
    pub fn new(inner: Arc<dyn ObjectBucket>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

#[async_trait]
impl ObjectBucket for GatedBucket {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> eventlake::Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            let permit = self.gate.acquire().await.map_err(|_| injected("gate"))?;
            permit.forget();
        }
        self.inner.put(key, data, content_type).await
    }

    async fn list(&self, prefix: &str) -> eventlake::Result<Vec<ObjectInfo>> {
        self.inner.list(prefix).await
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> eventlake::Result<SignedUrl> {
        self.inner.presign_get(key, ttl).await
    }

    async fn delete_many(&self, keys: &[String]) -> eventlake::Result<()> {
        self.inner.delete_many(keys).await
    }
}
