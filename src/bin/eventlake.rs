use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use eventlake::lifecycle::{run_logged, Intervals};
use eventlake::storage::tenant_manifest;
use eventlake::{
    BucketConfig, Compactor, EventRecord, Exporter, ObjectBucket, Pipeline, PipelineConfig,
    RemoteBucket, S3Config, StagingStore,
};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const INGEST_BATCH: usize = 500;

#[derive(Parser)]
#[command(name = "eventlake")]
#[command(about = "Stage tenant events and export them to partitioned Parquet on object storage")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct Settings {
    /// SQLite staging database
    #[arg(long, env = "STAGING_DB_PATH", default_value = "./data/staging.sqlite3")]
    staging_db: PathBuf,

    /// S3-compatible endpoint (R2, MinIO); AWS default when unset
    #[arg(long, env = "S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    #[arg(long, env = "S3_REGION", default_value = "auto")]
    s3_region: String,

    #[arg(long, env = "S3_BUCKET")]
    s3_bucket: Option<String>,

    #[arg(long, env = "S3_ACCESS_KEY_ID", hide_env_values = true)]
    s3_access_key_id: Option<String>,

    #[arg(long, env = "S3_SECRET_ACCESS_KEY", hide_env_values = true)]
    s3_secret_access_key: Option<String>,

    /// Store objects in a local directory instead of S3
    #[arg(long, env = "LOCAL_BUCKET_ROOT", conflicts_with = "s3_bucket")]
    local_bucket_root: Option<PathBuf>,

    /// Lifetime of signed read URLs in seconds
    #[arg(long, env = "PRESIGN_TTL_SECONDS", default_value_t = 900)]
    presign_ttl_seconds: u64,

    #[arg(long, env = "EXPORT_INTERVAL_MS", default_value_t = 60_000)]
    export_interval_ms: u64,

    #[arg(long, env = "COMPACTION_INTERVAL_MS", default_value_t = 3_600_000)]
    compaction_interval_ms: u64,

    /// Compaction target file size in MiB
    #[arg(long, env = "TARGET_PARQUET_MB", default_value_t = 128)]
    target_parquet_mb: u64,

    #[arg(long, env = "PARQUET_ZSTD_LEVEL", default_value_t = 3)]
    parquet_zstd_level: i32,

    /// Parent directory for per-cycle scratch files
    #[arg(long, env = "SCRATCH_DIR")]
    scratch_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the export and compaction loops until Ctrl-C
    Run,
    /// Run a single export cycle and exit
    ExportOnce,
    /// Run a single compaction cycle and exit
    CompactOnce,
    /// Stage events from a JSON-lines file
    Ingest {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print a tenant's exported objects with signed URLs as JSON
    Manifest {
        #[arg(long)]
        tenant: String,
    },
    /// Print staged row counts and watermarks as JSON
    Status,
    /// Delete staged rows already covered by a tenant's watermark
    Purge {
        #[arg(long)]
        tenant: String,
    },
}

impl Settings {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let bucket = match (&self.local_bucket_root, &self.s3_bucket) {
            (Some(root), _) => BucketConfig::Local { root: root.clone() },
            (None, Some(bucket)) => BucketConfig::S3(S3Config {
                endpoint: self.s3_endpoint.clone(),
                region: self.s3_region.clone(),
                bucket: bucket.clone(),
                access_key_id: self.s3_access_key_id.clone(),
                secret_access_key: self.s3_secret_access_key.clone(),
            }),
            (None, None) => anyhow::bail!("set S3_BUCKET or LOCAL_BUCKET_ROOT"),
        };
        let mut config = PipelineConfig::new(&self.staging_db, bucket)
            .with_target_mb(self.target_parquet_mb);
        config.presign_ttl = Duration::from_secs(self.presign_ttl_seconds);
        config.export_interval = Duration::from_millis(self.export_interval_ms);
        config.compaction_interval = Duration::from_millis(self.compaction_interval_ms);
        config.compression_level = self.parquet_zstd_level;
        config.scratch_dir = self.scratch_dir.clone();
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// One line of an ingest file. `properties` may be any JSON value.
#[derive(Deserialize)]
struct IngestLine {
    tenant_id: String,
    event_id: String,
    #[serde(with = "time::serde::rfc3339")]
    ts: OffsetDateTime,
    #[serde(rename = "type", default)]
    event_type: Option<String>,
    #[serde(default)]
    properties: Option<serde_json::Value>,
}

impl IngestLine {
    fn into_event(self) -> EventRecord {
        let properties = self.properties.map(|value| match value {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        });
        EventRecord {
            tenant_id: self.tenant_id,
            event_id: self.event_id,
            ts: self.ts,
            event_type: self.event_type,
            properties,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Ingest { file } => {
            let store = open_store(&cli.settings.staging_db)?;
            ingest(&store, &file)
        }
        Command::Status => {
            let store = open_store(&cli.settings.staging_db)?;
            status(&store)
        }
        Command::Purge { tenant } => {
            let store = open_store(&cli.settings.staging_db)?;
            let deleted = store.purge_exported(&tenant)?;
            println!("{deleted}");
            Ok(())
        }
        command => {
            let config = cli.settings.pipeline_config()?;
            run_pipeline(command, config).await
        }
    }
}

async fn run_pipeline(command: Command, config: PipelineConfig) -> Result<()> {
    let store = Arc::new(open_store(&config.staging_path)?);
    let bucket: Arc<dyn ObjectBucket> =
        Arc::new(RemoteBucket::from_config(&config.bucket).context("open bucket")?);
    let exporter = Exporter::new(Arc::clone(&store), Arc::clone(&bucket), &config);
    let compactor = Compactor::new(Arc::clone(&store), Arc::clone(&bucket), &config);

    match command {
        Command::Run => {
            let handle = Pipeline::start(
                Arc::new(exporter),
                Arc::new(compactor),
                Intervals {
                    export: config.export_interval,
                    compaction: config.compaction_interval,
                },
            );
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            log::info!("shutdown requested");
            handle.shutdown().await;
        }
        Command::ExportOnce => {
            if let Some(stats) = run_logged(&exporter).await {
                println!("{}", stats.summary());
            }
        }
        Command::CompactOnce => {
            if let Some(stats) = run_logged(&compactor).await {
                println!("{}", stats.summary());
            }
        }
        Command::Manifest { tenant } => {
            let manifest = tenant_manifest(bucket.as_ref(), &tenant, config.presign_ttl).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Command::Ingest { .. } | Command::Status | Command::Purge { .. } => {}
    }
    Ok(())
}

fn open_store(path: &Path) -> Result<StagingStore> {
    StagingStore::open(path).with_context(|| format!("open staging db {}", path.display()))
}

fn ingest(store: &StagingStore, file: &Path) -> Result<()> {
    let reader = std::io::BufReader::new(
        std::fs::File::open(file).with_context(|| format!("open {}", file.display()))?,
    );
    let mut by_tenant: BTreeMap<String, Vec<EventRecord>> = BTreeMap::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed: IngestLine = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}", file.display(), index + 1))?;
        let event = parsed.into_event();
        by_tenant.entry(event.tenant_id.clone()).or_default().push(event);
    }

    let mut total = 0;
    for (tenant, events) in &by_tenant {
        for batch in events.chunks(INGEST_BATCH) {
            total += store
                .append(tenant, batch)
                .with_context(|| format!("append tenant={tenant}"))?;
        }
    }
    log::info!("ingest: staged rows={total} tenants={}", by_tenant.len());
    Ok(())
}

fn status(store: &StagingStore) -> Result<()> {
    let mut watermarks = BTreeMap::new();
    for (tenant, ts) in store.offsets().all()? {
        watermarks.insert(tenant, ts.format(&Rfc3339)?);
    }
    let report = serde_json::json!({
        "schema_versions": store.schema_versions()?,
        "staged": store.count_by_tenant()?,
        "watermarks": watermarks,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
