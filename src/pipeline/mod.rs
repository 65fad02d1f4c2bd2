// src/pipeline/mod.rs
//! One scheduled run: fan-out → dedup → scoring/quality → admission, with
//! per-stage counts and the overlap guard. A failing stage never takes the
//! host process down; partial progress is kept, never rolled back.

pub mod budget;
pub mod dedup;
pub mod fanout;
pub mod providers;
pub mod run_record;
pub mod scheduler;
pub mod types;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::admit::admit_batch;
use crate::config::PipelineConfig;
use crate::pipeline::budget::BudgetLedger;
use crate::pipeline::dedup::{dedup_candidates, fingerprint};
use crate::pipeline::fanout::fetch_candidates;
use crate::pipeline::run_record::{RunRecordStore, RunStatus, StageCounts};
use crate::pipeline::types::{DateWindow, SourceConnector};
use crate::retry::RetryPolicy;
use crate::score::ai_adapter::DynAiClient;
use crate::score::{score_batch, TopicContext};
use crate::store::ArticleStore;

/// Everything a run needs, shared by the scheduler and the manual trigger.
pub struct PipelineDeps {
    pub connectors: Vec<Arc<dyn SourceConnector>>,
    pub ai: DynAiClient,
    pub store: Arc<dyn ArticleStore>,
    pub ledger: Arc<BudgetLedger>,
    pub run_records: Arc<RunRecordStore>,
}

/// What a finished (or skipped) run reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub counts: StageCounts,
}

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("admission_runs_total", "Pipeline runs started.");
        describe_counter!(
            "admission_runs_skipped_total",
            "Runs refused by the overlap guard."
        );
        describe_counter!("admission_fetched_total", "Raw candidates fetched.");
        describe_counter!(
            "admission_provider_failures_total",
            "Providers that failed after retry."
        );
        describe_counter!(
            "admission_budget_denied_total",
            "Providers skipped by the budget ledger."
        );
        describe_counter!(
            "admission_dedup_dropped_total",
            "Candidates dropped as duplicates."
        );
        describe_counter!(
            "admission_below_threshold_total",
            "Candidates below the relevance threshold."
        );
        describe_counter!(
            "admission_quality_rejected_total",
            "Candidates rejected by the quality gate."
        );
        describe_counter!(
            "admission_repair_failures_total",
            "Candidates failed closed on unrepairable AI output."
        );
        describe_counter!(
            "admission_score_errors_total",
            "Candidates lost to AI call errors."
        );
        describe_counter!("admission_admitted_total", "Candidates admitted.");
        describe_counter!(
            "admission_persist_failures_total",
            "Admissions lost to persistence failures."
        );
        describe_gauge!(
            "admission_last_run_ts",
            "Unix ts when the pipeline last finished a run."
        );
        describe_histogram!(
            "admission_fanout_parse_ms",
            "Provider response parse time in milliseconds."
        );
        describe_counter!("ai_calls_total", "Successful AI completions.");
        describe_counter!(
            "ai_limit_denied_total",
            "AI calls refused by the daily limit."
        );
        describe_counter!("analysis_cache_hits_total", "Analysis cache hits.");
        describe_counter!("analysis_cache_misses_total", "Analysis cache misses.");
    });
}

/// Execute one full admission cycle. Never panics and never returns an
/// error: every failure mode ends up in the summary.
pub async fn run_cycle(deps: &PipelineDeps, cfg: &PipelineConfig) -> RunSummary {
    ensure_metrics_described();
    counter!("admission_runs_total").increment(1);

    let record = match deps.run_records.begin() {
        Ok(Some(record)) => record,
        Ok(None) => {
            counter!("admission_runs_skipped_total").increment(1);
            tracing::info!("run skipped, a previous run is still in progress");
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            return RunSummary {
                run_id: String::from("skipped"),
                status: RunStatus::SkippedOverlap,
                started_at: now,
                finished_at: Some(now),
                counts: StageCounts::default(),
            };
        }
        Err(e) => {
            tracing::error!(error = ?e, "run record store unavailable");
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            return RunSummary {
                run_id: String::from("unstarted"),
                status: RunStatus::Failed,
                started_at: now,
                finished_at: Some(now),
                counts: StageCounts::default(),
            };
        }
    };

    // Stage counts live behind a mutex so a deadline expiry still reports
    // the partial progress made before cancellation.
    let counts = Mutex::new(StageCounts::default());
    let deadline = Duration::from_secs(cfg.run_deadline_secs.max(1));

    let status = match tokio::time::timeout(deadline, run_stages(deps, cfg, &counts)).await {
        Ok(()) => RunStatus::Completed,
        Err(_) => {
            tracing::warn!(run_id = %record.run_id, "run deadline expired, cancelling in-flight work");
            RunStatus::Failed
        }
    };

    let final_counts = *counts.lock().expect("stage counts mutex poisoned");
    gauge!("admission_last_run_ts").set(chrono::Utc::now().timestamp().max(0) as f64);

    let summary = RunSummary {
        run_id: record.run_id.clone(),
        status,
        started_at: record.started_at,
        finished_at: Some(chrono::Utc::now().timestamp().max(0) as u64),
        counts: final_counts,
    };
    deps.run_records.finalize(record, status, final_counts);

    tracing::info!(
        run_id = %summary.run_id,
        status = ?summary.status,
        fetched = final_counts.fetched,
        dedup_dropped = final_counts.dedup_dropped,
        below_threshold = final_counts.below_threshold,
        quality_rejected = final_counts.quality_rejected,
        repair_failures = final_counts.repair_failures,
        admitted = final_counts.admitted,
        "run finished"
    );
    summary
}

/// The cancellable part of the run. Counts are flushed after every stage;
/// admissions made before a cancellation stay admitted.
async fn run_stages(deps: &PipelineDeps, cfg: &PipelineConfig, counts: &Mutex<StageCounts>) {
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    let window = DateWindow::last_days(now, cfg.date_window_days.max(1));
    let retry = RetryPolicy::once_after(Duration::from_millis(cfg.retry_backoff_ms));

    // 1) Provider fan-out, budget-checked.
    let fanout = fetch_candidates(
        &deps.connectors,
        &cfg.keywords,
        window,
        &deps.ledger,
        retry,
        Duration::from_secs(cfg.provider_timeout_secs.max(1)),
    )
    .await;
    {
        let mut g = counts.lock().expect("stage counts mutex poisoned");
        g.fetched = fanout.candidates.len() as u64;
        g.provider_failures = fanout.provider_failures;
        g.budget_denied = fanout.budget_denied;
    }

    // 2) Dedup, in-run and against recent admissions for this topic.
    let lookback_since = now.saturating_sub(cfg.dedup_lookback_secs);
    let mut existing: HashSet<String> = HashSet::new();
    for cand in &fanout.candidates {
        let fp = fingerprint(&cand.title);
        if existing.contains(&fp) {
            continue;
        }
        let lookup = retry
            .run(|| deps.store.exists_fingerprint(&fp, &cfg.topic_id, lookback_since))
            .await;
        match lookup {
            Ok(true) => {
                existing.insert(fp);
            }
            Ok(false) => {}
            Err(e) => {
                // Lookup failure treats the candidate as new; the store's
                // idempotent insert keeps a real duplicate from doubling.
                tracing::warn!(error = ?e, "fingerprint lookup failed");
            }
        }
    }
    let (candidates, dedup_dropped) = dedup_candidates(fanout.candidates, &existing);
    {
        let mut g = counts.lock().expect("stage counts mutex poisoned");
        g.dedup_dropped = dedup_dropped;
    }
    counter!("admission_dedup_dropped_total").increment(dedup_dropped);

    // 3) Relevance scoring + quality gate, bounded concurrency.
    let topic = TopicContext {
        topic_id: cfg.topic_id.clone(),
        keywords: cfg.keywords.clone(),
    };
    let scored = score_batch(
        Arc::clone(&deps.ai),
        candidates,
        &topic,
        cfg.relevance_threshold,
        cfg.quality_control_enabled,
        cfg.scoring_concurrency,
        retry,
    )
    .await;
    {
        let mut g = counts.lock().expect("stage counts mutex poisoned");
        g.below_threshold = scored.below_threshold;
        g.quality_rejected = scored.quality_rejected;
        g.repair_failures = scored.repair_failures;
        g.score_errors = scored.score_errors;
    }

    // 4) Admission. Fingerprints registered here are visible to any
    //    subsequent duplicate check within this run.
    let registered: Mutex<HashSet<String>> = Mutex::new(existing);
    let admission = admit_batch(
        &deps.store,
        &cfg.topic_id,
        scored.accepted,
        &registered,
        retry,
        cfg.max_items_per_run,
    )
    .await;
    {
        let mut g = counts.lock().expect("stage counts mutex poisoned");
        g.admitted = admission.admitted;
        g.persist_failures = admission.persist_failures;
    }
}
