// src/pipeline/fanout.rs
//! Provider fan-out: one concurrent task per configured connector, budget
//! reservation before issuance, independent timeout and one retry per
//! provider. A failing provider is counted and skipped; it never aborts the
//! run for the others.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinSet;

use crate::pipeline::budget::BudgetLedger;
use crate::pipeline::types::{Candidate, DateWindow, SourceConnector};
use crate::retry::RetryPolicy;

#[derive(Debug, Default)]
pub struct FanoutOutcome {
    pub candidates: Vec<Candidate>,
    pub provider_failures: u64,
    pub budget_denied: u64,
}

pub async fn fetch_candidates(
    connectors: &[Arc<dyn SourceConnector>],
    keywords: &[String],
    window: DateWindow,
    ledger: &Arc<BudgetLedger>,
    retry: RetryPolicy,
    per_call_timeout: Duration,
) -> FanoutOutcome {
    let mut outcome = FanoutOutcome::default();
    let mut tasks: JoinSet<(String, u64, anyhow::Result<Vec<Candidate>>)> = JoinSet::new();

    for connector in connectors {
        let estimate = connector.estimated_requests(keywords);
        if !ledger.reserve(connector.name(), estimate) {
            outcome.budget_denied += 1;
            counter!("admission_budget_denied_total").increment(1);
            continue;
        }

        let connector = Arc::clone(connector);
        let keywords = keywords.to_vec();
        tasks.spawn(async move {
            let name = connector.name().to_string();
            // Timeout applies per attempt; the retry sees a timeout as just
            // another transient failure.
            let result = retry
                .run(|| {
                    let attempt = connector.search(&keywords, &window);
                    async move {
                        match tokio::time::timeout(per_call_timeout, attempt).await {
                            Ok(r) => r,
                            Err(_) => Err(anyhow::anyhow!("provider call timed out")),
                        }
                    }
                })
                .await;
            (name, estimate, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, estimate, Ok(mut items))) => {
                ledger.commit(&name, estimate);
                outcome.candidates.append(&mut items);
            }
            Ok((name, estimate, Err(e))) => {
                ledger.release(&name, estimate);
                outcome.provider_failures += 1;
                counter!("admission_provider_failures_total").increment(1);
                tracing::warn!(provider = %name, error = ?e, "provider fan-out failed");
            }
            Err(e) => {
                // A panicked provider task is a provider failure; its
                // reservation cannot be attributed, so it stays held for
                // this window.
                outcome.provider_failures += 1;
                counter!("admission_provider_failures_total").increment(1);
                tracing::warn!(error = ?e, "provider task join error");
            }
        }
    }

    outcome
}
