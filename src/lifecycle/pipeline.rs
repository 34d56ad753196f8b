//! Timer-driven loops for the export and compaction jobs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::lifecycle::CycleStats;

/// One periodic unit of work.
#[async_trait]
pub trait CycleJob: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Runs one cycle. Per-tenant failures are reported in the stats; an `Err`
    /// means the cycle could not start at all.
    async fn run_cycle(&self) -> anyhow::Result<CycleStats>;
}

#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub export: Duration,
    pub compaction: Duration,
}

/// Owns the running loops.
pub struct PipelineHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Signals every loop to stop and waits for them. A cycle in flight runs to
    /// completion first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                log::error!("pipeline: loop task failed: {err}");
            }
        }
        log::info!("pipeline: stopped");
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Spawns one loop per job. The first cycle of each job runs immediately.
    pub fn start(
        exporter: Arc<dyn CycleJob>,
        compactor: Arc<dyn CycleJob>,
        intervals: Intervals,
    ) -> PipelineHandle {
        let (tx, rx) = watch::channel(false);
        let tasks = vec![
            spawn_loop(exporter, intervals.export, rx.clone()),
            spawn_loop(compactor, intervals.compaction, rx),
        ];
        log::info!(
            "pipeline: started export_interval={:?} compaction_interval={:?}",
            intervals.export,
            intervals.compaction
        );
        PipelineHandle {
            shutdown: tx,
            tasks,
        }
    }
}

pub fn spawn_loop(
    job: Arc<dyn CycleJob>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            run_logged(job.as_ref()).await;
        }
        log::info!("{}: loop stopped", job.name());
    })
}

/// Runs one cycle and logs its outcome. Never propagates the error, so a loop
/// survives any failing cycle.
pub async fn run_logged(job: &dyn CycleJob) -> Option<CycleStats> {
    let started = Instant::now();
    match job.run_cycle().await {
        Ok(stats) if stats.skipped => {
            log::warn!("{}: previous cycle still running, skipped", job.name());
            Some(stats)
        }
        Ok(stats) => {
            if stats.has_errors() {
                log::warn!("{}: {}", job.name(), stats.summary());
            } else {
                log::info!("{}: {}", job.name(), stats.summary());
            }
            Some(stats)
        }
        Err(err) => {
            log::error!(
                "{}: cycle failed after {:?}: {err:#}",
                job.name(),
                started.elapsed()
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CycleJob for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_cycle(&self) -> anyhow::Result<CycleStats> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("always fails");
            }
            Ok(CycleStats::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loops_survive_errors_and_stop_on_shutdown() {
        let ok = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let failing = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            fail: true,
        });
        let handle = Pipeline::start(
            ok.clone(),
            failing.clone(),
            Intervals {
                export: Duration::from_secs(1),
                compaction: Duration::from_secs(1),
            },
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        handle.shutdown().await;

        let ok_runs = ok.runs.load(Ordering::SeqCst);
        let failing_runs = failing.runs.load(Ordering::SeqCst);
        assert!(ok_runs >= 3, "ok runs {ok_runs}");
        assert!(failing_runs >= 3, "failing runs {failing_runs}");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ok.runs.load(Ordering::SeqCst), ok_runs);
    }

    #[tokio::test]
    async fn run_logged_swallows_errors() {
        let failing = Counting {
            runs: AtomicUsize::new(0),
            fail: true,
        };
        assert!(run_logged(&failing).await.is_none());
        assert_eq!(failing.runs.load(Ordering::SeqCst), 1);
    }
}
