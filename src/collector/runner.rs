use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use chrono::{Local, NaiveDate, NaiveDateTime};
use log::{debug, error, info};
use tokio::time::sleep;

use crate::{
    collector::pipeline::{Pipeline, TickMode},
    collector::scheduler::{Cadence, Scheduler},
    config::SourceConfig,
    fetcher::{Fetcher, HttpTransport, RetryPolicy},
    metrics::METRICS,
    sources::adapter::SourceAdapter,
    store::{DayStore, persistence::LogArtifacts},
    uploader::Uploader,
};

/// Process-wide settings every source is built from.
#[derive(Clone)]
pub struct SourceContext {
    pub transport: Arc<dyn HttpTransport>,
    pub storage_dir: PathBuf,
    pub logs: Option<LogArtifacts>,
}

/// Wires one source's pipeline and scheduler from its configuration.
///
/// The adapter name tags the day-window files, so two sources never
/// share a window.
pub fn prepare_source(
    adapter: Arc<dyn SourceAdapter>,
    cfg: &SourceConfig,
    ctx: &SourceContext,
) -> anyhow::Result<(Pipeline, Scheduler)> {
    let mut store = DayStore::new(&ctx.storage_dir, adapter.name());
    if let Some(logs) = &ctx.logs {
        store = store.with_logs(logs.clone());
    }

    let fetcher = Fetcher::new(ctx.transport.clone(), RetryPolicy::from_config(&cfg.fetch));
    let uploader = cfg
        .sink
        .as_ref()
        .map(|sink| Uploader::new(ctx.transport.clone(), sink));

    let pipeline = Pipeline::new(
        adapter,
        fetcher,
        store,
        uploader,
        cfg.retention_days,
        cfg.max_pages,
    );
    let scheduler = Scheduler::from_config(cfg)?;

    Ok((pipeline, scheduler))
}

/// What happened to one due cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceOutcome {
    Ran,
    /// Outside market hours; counts as ran
    Gated,
    Failed,
}

/// Runs one source forever.
///
/// DESIGN:
/// - One wake-up per short interval
/// - Due cadences run one after the other, never concurrently
/// - The sleep starts after the last cadence finished, so a slow tick
///   delays the next one instead of overlapping it
///
/// This loop never exits; every failure is logged at the tick boundary.
pub async fn run_source(pipeline: Pipeline, mut scheduler: Scheduler) {
    info!(
        "[{}] collector started, waking every {:?}",
        pipeline.name(),
        scheduler.short_interval()
    );

    loop {
        run_due(
            &pipeline,
            &mut scheduler,
            Instant::now(),
            Local::now().naive_local(),
        )
        .await;

        sleep(scheduler.short_interval()).await;
    }
}

/// Runs every cadence due at `now` and records the outcomes.
///
/// `wall` is the local time used for market-hours gating and for the
/// day window being written. Each cadence is completed at the moment it
/// finished (`now` plus the time spent so far), so a slow long pull
/// does not shorten the wait before the next one.
pub async fn run_due(
    pipeline: &Pipeline,
    scheduler: &mut Scheduler,
    now: Instant,
    wall: NaiveDateTime,
) -> Vec<(Cadence, CadenceOutcome)> {
    let open = scheduler.is_open(wall);
    if !open {
        info!("[{}] Outside market hours, skipping", pipeline.name());
    }

    let started = Instant::now();
    let mut outcomes = Vec::new();
    for cadence in scheduler.due(now) {
        let outcome = if open {
            run_cadence(pipeline, cadence, wall.date()).await
        } else {
            METRICS.ticks_gated.fetch_add(1, Ordering::Relaxed);
            CadenceOutcome::Gated
        };

        let finished = now + started.elapsed();
        scheduler.complete(cadence, outcome != CadenceOutcome::Failed, finished);
        outcomes.push((cadence, outcome));
    }

    outcomes
}

async fn run_cadence(pipeline: &Pipeline, cadence: Cadence, today: NaiveDate) -> CadenceOutcome {
    debug!("[{}] running {:?} cadence", pipeline.name(), cadence);

    let succeeded = match cadence {
        Cadence::Short | Cadence::Long => {
            let mode = match cadence {
                Cadence::Long => TickMode::Full,
                _ => TickMode::Latest,
            };

            METRICS.ticks_run.fetch_add(1, Ordering::Relaxed);
            match pipeline.tick(mode, today).await {
                Ok(_) => true,
                Err(failure) => {
                    METRICS.ticks_failed.fetch_add(1, Ordering::Relaxed);
                    error!("[{}] {:?} tick {}", pipeline.name(), cadence, failure);
                    false
                }
            }
        }

        Cadence::Housekeeping => match pipeline.housekeep(today) {
            Ok(_) => true,
            Err(e) => {
                error!("[{}] Retention sweep failed: {}", pipeline.name(), e);
                false
            }
        },
    };

    if succeeded {
        CadenceOutcome::Ran
    } else {
        CadenceOutcome::Failed
    }
}
