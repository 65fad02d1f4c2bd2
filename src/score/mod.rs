// src/score/mod.rs
//! Relevance scoring and quality gating. Each candidate goes to the AI
//! collaborator once; the raw reply is structured by the repair engine.
//! Unrepairable output fails closed and is counted apart from deliberate
//! quality rejections, so model unreliability stays visible to operators.

pub mod ai_adapter;
pub mod repair;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::pipeline::types::Candidate;
use crate::retry::RetryPolicy;
use crate::score::ai_adapter::DynAiClient;

/// Longest candidate text (title + summary) embedded into a prompt, bytes.
const MAX_PROMPT_CONTENT_BYTES: usize = 2_000;

/// Outcome of scoring one candidate. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionVerdict {
    /// Continuous relevance in 0.0–1.0.
    pub relevance: f32,
    pub quality_pass: bool,
    pub reason: String,
    pub model: String,
}

/// Topic the active run is admitting content for.
#[derive(Debug, Clone)]
pub struct TopicContext {
    pub topic_id: String,
    pub keywords: Vec<String>,
}

/// Why a candidate produced no verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreFailure {
    /// The AI call itself failed after retries (transport, limit, disabled).
    AiUnavailable,
    /// The reply arrived but no repair strategy could structure it.
    RepairFailed,
}

#[derive(Debug)]
pub struct ScoredBatch {
    /// Candidates that passed both the relevance threshold and the quality
    /// gate, paired with their verdicts, in input order.
    pub accepted: Vec<(Candidate, AdmissionVerdict)>,
    pub below_threshold: u64,
    pub quality_rejected: u64,
    pub repair_failures: u64,
    pub score_errors: u64,
}

/// Expected reply shape; anything extra in the payload is ignored.
#[derive(Debug, Deserialize)]
struct VerdictPayload {
    score: f32,
    pass: bool,
    #[serde(default)]
    reason: Option<String>,
}

fn build_prompt(candidate: &Candidate, topic: &TopicContext) -> String {
    let mut content = candidate.title.clone();
    if let Some(summary) = &candidate.summary {
        content.push_str("\n\n");
        content.push_str(summary);
    }
    let content = truncate_to_char_boundary(&content, MAX_PROMPT_CONTENT_BYTES);

    format!(
        "You assess news items for the topic \"{}\" (keywords: {}).\n\
         Reply with ONLY a JSON object: {{\"score\": <0.0-1.0 relevance>, \
         \"pass\": <true if the item is substantive and trustworthy>, \
         \"reason\": \"<one short sentence>\"}}.\n\n\
         Item from {}:\n{}",
        topic.topic_id,
        topic.keywords.join(", "),
        candidate.source,
        content
    )
}

/// Truncate at a char boundary so prompts stay bounded without splitting
/// a multi-byte character.
fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

/// Score a single candidate. `Err(ScoreFailure)` means fail-closed.
pub async fn score_candidate(
    ai: &DynAiClient,
    candidate: &Candidate,
    topic: &TopicContext,
    retry: RetryPolicy,
) -> std::result::Result<AdmissionVerdict, ScoreFailure> {
    let prompt = build_prompt(candidate, topic);

    let raw = match retry.run(|| ai.complete(&prompt)).await {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(url = %candidate.url, error = ?e, "ai scoring call failed");
            return Err(ScoreFailure::AiUnavailable);
        }
    };

    let value = match repair::repair(&raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(url = %candidate.url, error = ?e, "unrepairable ai reply");
            return Err(ScoreFailure::RepairFailed);
        }
    };

    match parse_verdict(value, ai.model_name()) {
        Ok(v) => Ok(v),
        Err(e) => {
            tracing::warn!(url = %candidate.url, error = ?e, "ai reply missing verdict fields");
            Err(ScoreFailure::RepairFailed)
        }
    }
}

fn parse_verdict(value: serde_json::Value, model: &str) -> Result<AdmissionVerdict> {
    let payload: VerdictPayload =
        serde_json::from_value(value).map_err(|e| anyhow!("verdict shape: {e}"))?;
    Ok(AdmissionVerdict {
        relevance: payload.score.clamp(0.0, 1.0),
        quality_pass: payload.pass,
        reason: payload.reason.unwrap_or_default(),
        model: model.to_string(),
    })
}

/// Score a batch with a bounded concurrency ceiling, then apply the
/// relevance threshold and the quality gate. Threshold rejection is checked
/// first, matching the stage order of the pipeline.
pub async fn score_batch(
    ai: DynAiClient,
    candidates: Vec<Candidate>,
    topic: &TopicContext,
    threshold: f32,
    quality_control_enabled: bool,
    concurrency: usize,
    retry: RetryPolicy,
) -> ScoredBatch {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let topic = Arc::new(topic.clone());
    let mut tasks: JoinSet<(usize, Candidate, std::result::Result<AdmissionVerdict, ScoreFailure>)> =
        JoinSet::new();

    for (idx, candidate) in candidates.into_iter().enumerate() {
        let ai = Arc::clone(&ai);
        let topic = Arc::clone(&topic);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let outcome = score_candidate(&ai, &candidate, &topic, retry).await;
            (idx, candidate, outcome)
        });
    }

    let mut scored = Vec::new();
    let mut batch = ScoredBatch {
        accepted: Vec::new(),
        below_threshold: 0,
        quality_rejected: 0,
        repair_failures: 0,
        score_errors: 0,
    };

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(item) => scored.push(item),
            Err(e) => {
                batch.score_errors += 1;
                counter!("admission_score_errors_total").increment(1);
                tracing::warn!(error = ?e, "scoring task join error");
            }
        }
    }
    // Completion order is arbitrary; restore input order for stable admission.
    scored.sort_by_key(|(idx, _, _)| *idx);

    for (_, candidate, outcome) in scored {
        match outcome {
            Ok(verdict) => {
                if verdict.relevance < threshold {
                    batch.below_threshold += 1;
                    counter!("admission_below_threshold_total").increment(1);
                } else if quality_control_enabled && !verdict.quality_pass {
                    batch.quality_rejected += 1;
                    counter!("admission_quality_rejected_total").increment(1);
                } else {
                    batch.accepted.push((candidate, verdict));
                }
            }
            Err(ScoreFailure::RepairFailed) => {
                batch.repair_failures += 1;
                counter!("admission_repair_failures_total").increment(1);
            }
            Err(ScoreFailure::AiUnavailable) => {
                batch.score_errors += 1;
                counter!("admission_score_errors_total").increment(1);
            }
        }
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::ai_adapter::MockAiClient;
    use std::time::Duration;

    fn cand(n: usize) -> Candidate {
        Candidate {
            source: "wire".into(),
            url: format!("https://example.com/{n}"),
            title: format!("item {n}"),
            summary: Some("summary".into()),
            published_at: Some(1),
            fetched_at: 1,
            provider_id: format!("{n}"),
        }
    }

    fn topic() -> TopicContext {
        TopicContext {
            topic_id: "energy".into(),
            keywords: vec!["battery".into()],
        }
    }

    #[tokio::test]
    async fn threshold_is_inclusive() {
        let ai: DynAiClient = Arc::new(MockAiClient::sequence(
            vec![
                r#"{"score": 0.9, "pass": true}"#.into(),
                r#"{"score": 0.5, "pass": true}"#.into(),
                r#"{"score": 0.61, "pass": true}"#.into(),
            ],
            "{}",
        ));
        let batch = score_batch(
            ai,
            vec![cand(1), cand(2), cand(3)],
            &topic(),
            0.6,
            true,
            1, // sequential so the scripted replies line up with inputs
            RetryPolicy::none(),
        )
        .await;
        assert_eq!(batch.accepted.len(), 2);
        assert_eq!(batch.below_threshold, 1);
    }

    #[tokio::test]
    async fn quality_gate_rejects_failing_verdicts() {
        let ai: DynAiClient = Arc::new(MockAiClient::fixed(
            r#"{"score": 0.9, "pass": false, "reason": "thin content"}"#,
        ));
        let batch = score_batch(
            ai,
            vec![cand(1)],
            &topic(),
            0.6,
            true,
            2,
            RetryPolicy::none(),
        )
        .await;
        assert!(batch.accepted.is_empty());
        assert_eq!(batch.quality_rejected, 1);
        assert_eq!(batch.repair_failures, 0);
    }

    #[tokio::test]
    async fn quality_gate_can_be_disabled() {
        let ai: DynAiClient = Arc::new(MockAiClient::fixed(
            r#"{"score": 0.9, "pass": false}"#,
        ));
        let batch = score_batch(
            ai,
            vec![cand(1)],
            &topic(),
            0.6,
            false,
            2,
            RetryPolicy::none(),
        )
        .await;
        assert_eq!(batch.accepted.len(), 1);
    }

    #[tokio::test]
    async fn unrepairable_reply_fails_closed_as_repair_failure() {
        let ai: DynAiClient = Arc::new(MockAiClient::fixed("I cannot help with that."));
        let batch = score_batch(
            ai,
            vec![cand(1)],
            &topic(),
            0.6,
            true,
            2,
            RetryPolicy::none(),
        )
        .await;
        assert!(batch.accepted.is_empty());
        assert_eq!(batch.repair_failures, 1);
        assert_eq!(batch.quality_rejected, 0);
    }

    #[tokio::test]
    async fn fenced_reply_is_extracted() {
        let ai: DynAiClient = Arc::new(MockAiClient::fixed(
            "Sure! ```json\n{\"score\":0.8,\"pass\":true}\n```",
        ));
        let verdict = score_candidate(&ai, &cand(1), &topic(), RetryPolicy::none())
            .await
            .unwrap();
        assert!((verdict.relevance - 0.8).abs() < f32::EPSILON);
        assert!(verdict.quality_pass);
        assert_eq!(verdict.model, "mock");
    }

    #[tokio::test]
    async fn out_of_range_scores_are_clamped() {
        let ai: DynAiClient = Arc::new(MockAiClient::fixed(r#"{"score": 3.2, "pass": true}"#));
        let verdict = score_candidate(&ai, &cand(1), &topic(), RetryPolicy::none())
            .await
            .unwrap();
        assert!((verdict.relevance - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn prompt_stays_bounded() {
        let mut c = cand(1);
        c.summary = Some("x".repeat(50_000));
        let prompt = build_prompt(&c, &topic());
        assert!(prompt.len() < MAX_PROMPT_CONTENT_BYTES + 500);
    }

    #[tokio::test]
    async fn ai_error_counts_as_score_error_not_repair_failure() {
        let ai: DynAiClient = Arc::new(crate::score::ai_adapter::DisabledClient);
        let batch = score_batch(
            ai,
            vec![cand(1)],
            &topic(),
            0.6,
            true,
            2,
            RetryPolicy::none(),
        )
        .await;
        assert_eq!(batch.score_errors, 1);
        assert_eq!(batch.repair_failures, 0);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate_to_char_boundary(s, 2);
        assert!(s.starts_with(t));
        assert!(t.len() <= 2);
    }
}
