//! Overlap guard semantics: a run that starts while a previous run record is
//! still `running` is skipped and performs zero fan-out/scoring/admission
//! work. The guard is a persisted record, so it also survives restarts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use content_admission_pipeline::config::PipelineConfig;
use content_admission_pipeline::pipeline::budget::{BudgetCeilings, BudgetLedger};
use content_admission_pipeline::pipeline::run_record::{RunRecordStore, RunStatus};
use content_admission_pipeline::pipeline::types::{Candidate, DateWindow, SourceConnector};
use content_admission_pipeline::pipeline::{run_cycle, PipelineDeps};
use content_admission_pipeline::score::ai_adapter::{DynAiClient, MockAiClient};
use content_admission_pipeline::store::InMemoryStore;

/// Connector that counts how many times it was queried.
struct CountingConnector {
    calls: Arc<AtomicU32>,
}

#[async_trait::async_trait]
impl SourceConnector for CountingConnector {
    async fn search(&self, _k: &[String], _w: &DateWindow) -> Result<Vec<Candidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![])
    }
    fn name(&self) -> &str {
        "counting"
    }
}

fn deps_with(
    records: Arc<RunRecordStore>,
    calls: Arc<AtomicU32>,
) -> PipelineDeps {
    PipelineDeps {
        connectors: vec![Arc::new(CountingConnector { calls })],
        ai: Arc::new(MockAiClient::fixed(r#"{"score":0.9,"pass":true}"#)) as DynAiClient,
        store: Arc::new(InMemoryStore::new()),
        ledger: Arc::new(BudgetLedger::new(BudgetCeilings {
            per_provider: 0,
            aggregate: 0,
        })),
        run_records: records,
    }
}

#[tokio::test]
async fn run_while_previous_is_running_is_skipped_with_zero_work() {
    let dir = tempfile::tempdir().unwrap();
    let records = Arc::new(RunRecordStore::new(dir.path().join("run_record.json"), 3600));

    // Simulate an in-flight run holding the guard.
    let _running = records.begin().unwrap().expect("first run starts");

    let calls = Arc::new(AtomicU32::new(0));
    let deps = deps_with(Arc::clone(&records), Arc::clone(&calls));
    let cfg = PipelineConfig::default();

    let summary = run_cycle(&deps, &cfg).await;
    assert_eq!(summary.status, RunStatus::SkippedOverlap);
    assert_eq!(summary.counts.fetched, 0);
    assert_eq!(summary.counts.admitted, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no fan-out may happen");
}

#[tokio::test]
async fn skip_leaves_the_running_record_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let records = Arc::new(RunRecordStore::new(dir.path().join("run_record.json"), 3600));
    let running = records.begin().unwrap().expect("first run starts");

    let calls = Arc::new(AtomicU32::new(0));
    let deps = deps_with(Arc::clone(&records), calls);
    let cfg = PipelineConfig::default();
    let _ = run_cycle(&deps, &cfg).await;

    let last = records.last().expect("record still present");
    assert_eq!(last.run_id, running.run_id);
    assert_eq!(last.status, RunStatus::Running);
}

#[tokio::test]
async fn guard_survives_process_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run_record.json");

    {
        let records = RunRecordStore::new(path.clone(), 3600);
        let _running = records.begin().unwrap().expect("first run starts");
        // Process "dies" here without finalizing.
    }

    let records = Arc::new(RunRecordStore::new(path, 3600));
    let calls = Arc::new(AtomicU32::new(0));
    let deps = deps_with(records, Arc::clone(&calls));
    let cfg = PipelineConfig::default();

    let summary = run_cycle(&deps, &cfg).await;
    assert_eq!(summary.status, RunStatus::SkippedOverlap);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn next_run_proceeds_after_finalization() {
    let dir = tempfile::tempdir().unwrap();
    let records = Arc::new(RunRecordStore::new(dir.path().join("run_record.json"), 3600));

    let calls = Arc::new(AtomicU32::new(0));
    let deps = deps_with(Arc::clone(&records), Arc::clone(&calls));
    let cfg = PipelineConfig::default();

    let first = run_cycle(&deps, &cfg).await;
    assert_eq!(first.status, RunStatus::Completed);

    let second = run_cycle(&deps, &cfg).await;
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
