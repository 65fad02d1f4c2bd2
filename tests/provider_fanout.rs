//! Fan-out isolation and budget interplay at the run level.
//!
//! Covered (strict):
//! - provider A returns 10 items while provider B times out twice and
//!   fails: fetched = 10, provider_failures = 1, no run-level error
//! - budget-denied providers are skipped and counted, not errored
//! - failed calls release their reservation (ledger reflects actual usage)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use content_admission_pipeline::pipeline::budget::{BudgetCeilings, BudgetLedger};
use content_admission_pipeline::pipeline::fanout::fetch_candidates;
use content_admission_pipeline::pipeline::types::{Candidate, DateWindow, SourceConnector};
use content_admission_pipeline::retry::RetryPolicy;

struct HealthyConnector {
    name: &'static str,
    count: usize,
}

#[async_trait]
impl SourceConnector for HealthyConnector {
    async fn search(&self, _k: &[String], _w: &DateWindow) -> Result<Vec<Candidate>> {
        Ok((0..self.count)
            .map(|i| Candidate {
                source: self.name.to_string(),
                url: format!("https://{}.example/{i}", self.name),
                title: format!("{} item {i}", self.name),
                summary: None,
                published_at: Some(1_700_000_000),
                fetched_at: 1_700_000_000,
                provider_id: format!("{}-{i}", self.name),
            })
            .collect())
    }
    fn name(&self) -> &str {
        self.name
    }
}

/// Sleeps past any reasonable timeout, simulating a hung upstream.
struct HangingConnector;

#[async_trait]
impl SourceConnector for HangingConnector {
    async fn search(&self, _k: &[String], _w: &DateWindow) -> Result<Vec<Candidate>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(anyhow!("unreachable"))
    }
    fn name(&self) -> &str {
        "hanging"
    }
}

fn window() -> DateWindow {
    DateWindow {
        since: 0,
        until: u64::MAX,
    }
}

#[tokio::test]
async fn one_provider_timing_out_twice_never_affects_the_other() {
    let a = Arc::new(HealthyConnector {
        name: "a",
        count: 10,
    }) as Arc<dyn SourceConnector>;
    let b = Arc::new(HangingConnector) as Arc<dyn SourceConnector>;

    let ledger = Arc::new(BudgetLedger::new(BudgetCeilings {
        per_provider: 100,
        aggregate: 0,
    }));

    let out = fetch_candidates(
        &[a, b],
        &[],
        window(),
        &ledger,
        // One retry: the hanging provider times out twice in total.
        RetryPolicy::once_after(Duration::from_millis(1)),
        Duration::from_millis(50),
    )
    .await;

    assert_eq!(out.candidates.len(), 10);
    assert_eq!(out.provider_failures, 1);
    assert_eq!(out.budget_denied, 0);
    // The failed provider's reservation was released, not consumed.
    assert_eq!(ledger.consumed("hanging"), 0);
    assert_eq!(ledger.consumed("a"), 1);
}

#[tokio::test]
async fn budget_denial_skips_the_provider_without_error() {
    let a = Arc::new(HealthyConnector { name: "a", count: 3 }) as Arc<dyn SourceConnector>;
    let b = Arc::new(HealthyConnector { name: "b", count: 3 }) as Arc<dyn SourceConnector>;

    // Room for exactly one provider's single request.
    let ledger = Arc::new(BudgetLedger::new(BudgetCeilings {
        per_provider: 0,
        aggregate: 1,
    }));

    let out = fetch_candidates(
        &[a, b],
        &[],
        window(),
        &ledger,
        RetryPolicy::none(),
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(out.candidates.len(), 3, "the granted provider still ran");
    assert_eq!(out.budget_denied, 1);
    assert_eq!(out.provider_failures, 0);
    assert_eq!(ledger.total_consumed(), 1);
}

#[tokio::test]
async fn all_providers_denied_yields_an_empty_quiet_run() {
    let a = Arc::new(HealthyConnector { name: "a", count: 3 }) as Arc<dyn SourceConnector>;
    let ledger = Arc::new(BudgetLedger::new(BudgetCeilings {
        per_provider: 0,
        aggregate: 2,
    }));
    assert!(ledger.reserve("earlier-run", 2)); // window already exhausted

    let out = fetch_candidates(
        &[a],
        &[],
        window(),
        &ledger,
        RetryPolicy::none(),
        Duration::from_secs(5),
    )
    .await;

    assert!(out.candidates.is_empty());
    assert_eq!(out.budget_denied, 1);
    assert_eq!(out.provider_failures, 0);
}
