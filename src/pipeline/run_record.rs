// src/pipeline/run_record.rs
//! Run records: one entry per scheduler invocation with an explicit
//! lifecycle (running/completed/failed/skipped). The record is a JSON file
//! rather than an in-process flag, so the overlap guard survives restarts.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    SkippedOverlap,
}

/// Per-stage counters reported in the run summary. Operators need to tell
/// "fetched but filtered out" from "fetch failed" from "admitted".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub fetched: u64,
    pub provider_failures: u64,
    pub budget_denied: u64,
    pub dedup_dropped: u64,
    pub below_threshold: u64,
    pub quality_rejected: u64,
    pub repair_failures: u64,
    pub score_errors: u64,
    pub admitted: u64,
    pub persist_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: u64,
    pub finished_at: Option<u64>,
    pub status: RunStatus,
    pub counts: StageCounts,
}

/// File-backed store for the current/last run record.
pub struct RunRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
    /// A `running` record older than this is treated as abandoned (e.g. the
    /// process died mid-run) and no longer blocks new runs.
    stale_after_secs: u64,
}

impl RunRecordStore {
    pub fn new(path: PathBuf, stale_after_secs: u64) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
            stale_after_secs,
        }
    }

    /// Try to open a new run. Returns `None` when an unfinished run record
    /// exists (overlap guard); the caller must skip without doing any work.
    pub fn begin(&self) -> Result<Option<RunRecord>> {
        let _g = self.lock.lock().expect("run record mutex poisoned");
        let now = now_unix();

        if let Some(prev) = read_record(&self.path) {
            if prev.status == RunStatus::Running {
                let age = now.saturating_sub(prev.started_at);
                if age < self.stale_after_secs {
                    return Ok(None);
                }
                // Abandoned run: finalize it as failed before starting anew.
                let mut abandoned = prev;
                abandoned.status = RunStatus::Failed;
                abandoned.finished_at = Some(now);
                tracing::warn!(
                    run_id = %abandoned.run_id,
                    age_secs = age,
                    "abandoned running record found, finalizing as failed"
                );
                write_record(&self.path, &abandoned)?;
            }
        }

        let record = RunRecord {
            run_id: format!("run-{now}-{:04x}", std::process::id() & 0xffff),
            started_at: now,
            finished_at: None,
            status: RunStatus::Running,
            counts: StageCounts::default(),
        };
        write_record(&self.path, &record)?;
        Ok(Some(record))
    }

    /// Finalize the current run with its terminal status and counts.
    pub fn finalize(&self, mut record: RunRecord, status: RunStatus, counts: StageCounts) {
        let _g = self.lock.lock().expect("run record mutex poisoned");
        record.status = status;
        record.counts = counts;
        record.finished_at = Some(now_unix());
        if let Err(e) = write_record(&self.path, &record) {
            tracing::warn!(error = ?e, run_id = %record.run_id, "failed to persist run record");
        }
    }

    /// Most recent record, finished or not.
    pub fn last(&self) -> Option<RunRecord> {
        let _g = self.lock.lock().expect("run record mutex poisoned");
        read_record(&self.path)
    }
}

fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn read_record(path: &Path) -> Option<RunRecord> {
    let s = fs::read_to_string(path).ok()?;
    serde_json::from_str(&s).ok()
}

fn write_record(path: &Path, record: &RunRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(record)?;
    let mut f = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    f.write_all(json.as_bytes())?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> RunRecordStore {
        RunRecordStore::new(dir.path().join("run_record.json"), 3600)
    }

    #[test]
    fn begin_then_finalize_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let rec = store.begin().unwrap().expect("first run starts");
        assert_eq!(rec.status, RunStatus::Running);

        let mut counts = StageCounts::default();
        counts.admitted = 3;
        store.finalize(rec, RunStatus::Completed, counts);

        let last = store.last().unwrap();
        assert_eq!(last.status, RunStatus::Completed);
        assert_eq!(last.counts.admitted, 3);
        assert!(last.finished_at.is_some());
    }

    #[test]
    fn running_record_blocks_second_begin() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let _rec = store.begin().unwrap().expect("first run starts");
        assert!(store.begin().unwrap().is_none(), "overlap must be refused");
    }

    #[test]
    fn overlap_guard_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_record.json");

        let store = RunRecordStore::new(path.clone(), 3600);
        let _rec = store.begin().unwrap().expect("first run starts");
        drop(store);

        let reopened = RunRecordStore::new(path, 3600);
        assert!(reopened.begin().unwrap().is_none());
    }

    #[test]
    fn stale_running_record_is_failed_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_record.json");

        let store = RunRecordStore::new(path.clone(), 0); // everything is stale
        let _rec = store.begin().unwrap().expect("first run starts");

        let next = store.begin().unwrap();
        assert!(next.is_some(), "stale running record must not block forever");
    }
}
