// src/pipeline/types.rs
use anyhow::Result;

/// A raw item fetched from a source connector, before any admission decision.
/// Never mutated after creation; discarded at the end of a run unless admitted.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct Candidate {
    pub source: String, // e.g., "wire", "industry-rss"
    pub url: String,
    pub title: String,
    pub summary: Option<String>,
    /// Unix seconds. `None` when the provider omitted the date or sent
    /// something unparseable.
    pub published_at: Option<u64>,
    pub fetched_at: u64,
    pub provider_id: String,
}

/// Inclusive date window (unix seconds) for provider queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub since: u64,
    pub until: u64,
}

impl DateWindow {
    /// Window ending now and reaching `days` back.
    pub fn last_days(now: u64, days: u64) -> Self {
        Self {
            since: now.saturating_sub(days * 86_400),
            until: now,
        }
    }

    pub fn contains(&self, ts: u64) -> bool {
        ts >= self.since && ts <= self.until
    }
}

#[async_trait::async_trait]
pub trait SourceConnector: Send + Sync {
    /// Query the source for items matching any of `keywords` inside `window`.
    async fn search(&self, keywords: &[String], window: &DateWindow) -> Result<Vec<Candidate>>;

    fn name(&self) -> &str;

    /// How many upstream requests one `search` call will consume. Consulted
    /// by the budget ledger before the call is issued.
    fn estimated_requests(&self, keywords: &[String]) -> u64 {
        let _ = keywords;
        1
    }
}
