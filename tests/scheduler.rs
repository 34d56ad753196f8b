mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use time::macros::datetime;

use common::{event, Fixture};
use eventlake::lifecycle::Intervals;
use eventlake::{Compactor, Exporter, ObjectBucket, Pipeline};

#[tokio::test]
async fn busy_guard_skips_the_cycle() -> Result<()> {
    let fx = Fixture::new()?;
    fx.store.append("t1", &[event("t1", "a", datetime!(2024-03-05 09:00 UTC))])?;
    let exporter = Exporter::new(fx.store.clone(), fx.dyn_bucket(), &fx.config);

    let permit = exporter.guard().try_enter().expect("guard free");
    let stats = exporter.run_once().await?;
    assert!(stats.skipped);
    assert!(fx.bucket.list("tenant_id=t1/").await?.is_empty());

    drop(permit);
    let stats = exporter.run_once().await?;
    assert!(!stats.skipped);
    assert_eq!(stats.objects_written, 1);
    Ok(())
}

#[tokio::test]
async fn compactor_guard_is_independent_of_exporter() -> Result<()> {
    let fx = Fixture::new()?;
    let exporter = Exporter::new(fx.store.clone(), fx.dyn_bucket(), &fx.config);
    let compactor = Compactor::new(fx.store.clone(), fx.dyn_bucket(), &fx.config);

    let _held = exporter.guard().try_enter().expect("guard free");
    assert!(!compactor.run_once().await?.skipped);
    Ok(())
}

#[tokio::test]
async fn pipeline_exports_then_stops() -> Result<()> {
    let fx = Fixture::new()?;
    fx.store.append("t1", &[event("t1", "a", datetime!(2024-03-05 09:00 UTC))])?;

    let exporter = Arc::new(Exporter::new(fx.store.clone(), fx.dyn_bucket(), &fx.config));
    let compactor = Arc::new(Compactor::new(fx.store.clone(), fx.dyn_bucket(), &fx.config));
    let handle = Pipeline::start(
        exporter,
        compactor,
        Intervals {
            export: Duration::from_millis(20),
            compaction: Duration::from_secs(3600),
        },
    );

    let mut exported = false;
    for _ in 0..100 {
        if fx.store.offsets().get("t1")? == datetime!(2024-03-05 09:00 UTC) {
            exported = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::timeout(Duration::from_secs(10), handle.shutdown()).await?;

    assert!(exported, "export loop never advanced the watermark");
    assert_eq!(fx.bucket.list("tenant_id=t1/").await?.len(), 1);
    Ok(())
}
