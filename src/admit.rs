// src/admit.rs
//! Admission writer: persists accepted candidates with their verdicts, then
//! registers fingerprints so later duplicate checks in the same run see
//! them. Per-item persistence failures are counted, never fatal to the
//! batch.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use metrics::counter;

use crate::pipeline::dedup::fingerprint;
use crate::pipeline::types::Candidate;
use crate::retry::RetryPolicy;
use crate::score::AdmissionVerdict;
use crate::store::{AdmittedItem, ArticleStore};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionOutcome {
    pub admitted: u64,
    pub persist_failures: u64,
}

/// Admit a batch of scored candidates, up to `max_items`. `registered`
/// is the run-shared fingerprint set; registration happens after a
/// successful insert so a lost item can resurface on a future run.
pub async fn admit_batch(
    store: &Arc<dyn ArticleStore>,
    topic_id: &str,
    accepted: Vec<(Candidate, AdmissionVerdict)>,
    registered: &Mutex<HashSet<String>>,
    retry: RetryPolicy,
    max_items: usize,
) -> AdmissionOutcome {
    let mut outcome = AdmissionOutcome::default();
    let now = chrono::Utc::now().timestamp().max(0) as u64;

    for (candidate, verdict) in accepted.into_iter().take(max_items.max(1)) {
        let fp = fingerprint(&candidate.title);
        let item = AdmittedItem {
            candidate,
            verdict,
            topic_id: topic_id.to_string(),
            fingerprint: fp.clone(),
            admitted_at: now,
        };

        match retry.run(|| store.insert(&item)).await {
            Ok(()) => {
                registered
                    .lock()
                    .expect("fingerprint set mutex poisoned")
                    .insert(fp);
                outcome.admitted += 1;
                counter!("admission_admitted_total").increment(1);
            }
            Err(e) => {
                outcome.persist_failures += 1;
                counter!("admission_persist_failures_total").increment(1);
                tracing::warn!(url = %item.candidate.url, error = ?e, "failed to persist admitted item");
            }
        }
    }

    outcome
}
