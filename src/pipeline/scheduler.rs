// src/pipeline/scheduler.rs
//! Interval scheduler. Ticks never run the pipeline inline: each tick spawns
//! the run on a worker task, so a slow run cannot delay the next tick; the
//! overlap guard absorbs it instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::PipelineConfig;
use crate::pipeline::{run_cycle, PipelineDeps, RunSummary};

pub fn spawn_scheduler(deps: Arc<PipelineDeps>, cfg: Arc<PipelineConfig>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(cfg.check_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let deps = Arc::clone(&deps);
            let cfg = Arc::clone(&cfg);
            tokio::spawn(async move {
                let summary = run_cycle(&deps, &cfg).await;
                tracing::info!(
                    target: "scheduler",
                    run_id = %summary.run_id,
                    status = ?summary.status,
                    admitted = summary.counts.admitted,
                    "scheduled tick finished"
                );
            });
        }
    })
}

/// Manual override of the schedule: runs one cycle right now and reports
/// its summary. Subject to the same overlap guard as scheduled ticks.
pub async fn trigger_run_now(deps: &PipelineDeps, cfg: &PipelineConfig) -> RunSummary {
    run_cycle(deps, cfg).await
}
