// src/api.rs
//! HTTP surface for collaborators (UI layer, operators): manual run
//! trigger, last-run summary, cache invalidation, and on-demand analyses
//! served through the analysis cache.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::cache::{AnalysisCache, AnalysisKey};
use crate::config::PipelineConfig;
use crate::pipeline::scheduler::trigger_run_now;
use crate::pipeline::{PipelineDeps, RunSummary};
use crate::score::repair;

#[derive(Clone)]
pub struct AppState {
    pub deps: Arc<PipelineDeps>,
    pub cfg: Arc<PipelineConfig>,
    pub cache: Arc<AnalysisCache>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/run/trigger", post(run_trigger))
        .route("/run/last", get(run_last))
        .route("/cache/invalidate", post(cache_invalidate))
        .route("/analysis", post(analysis))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn run_trigger(State(state): State<AppState>) -> Json<RunSummary> {
    let summary = trigger_run_now(&state.deps, &state.cfg).await;
    Json(summary)
}

async fn run_last(State(state): State<AppState>) -> Result<Json<RunSummary>, StatusCode> {
    match state.deps.run_records.last() {
        Some(record) => Ok(Json(RunSummary {
            run_id: record.run_id,
            status: record.status,
            started_at: record.started_at,
            finished_at: record.finished_at,
            counts: record.counts,
        })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(serde::Deserialize)]
struct InvalidateReq {
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(default)]
    all: bool,
}

#[derive(serde::Serialize)]
struct InvalidateResp {
    invalidated: usize,
}

async fn cache_invalidate(
    State(state): State<AppState>,
    Json(body): Json<InvalidateReq>,
) -> Result<Json<InvalidateResp>, (StatusCode, String)> {
    if body.all {
        let n = state.cache.invalidate_all();
        return Ok(Json(InvalidateResp { invalidated: n }));
    }
    match body.fingerprint {
        Some(fp) => {
            let n = usize::from(state.cache.invalidate(&fp));
            Ok(Json(InvalidateResp { invalidated: n }))
        }
        None => Err((
            StatusCode::BAD_REQUEST,
            "either \"fingerprint\" or \"all\": true is required".to_string(),
        )),
    }
}

#[derive(serde::Deserialize)]
struct AnalysisReq {
    view_id: String,
    #[serde(default = "default_date_range")]
    date_range: String,
    #[serde(default = "default_sample_mode")]
    sample_mode: String,
    #[serde(default)]
    profile_id: String,
    #[serde(default)]
    force_refresh: bool,
}

fn default_date_range() -> String {
    "7d".to_string()
}

fn default_sample_mode() -> String {
    "auto".to_string()
}

#[derive(serde::Serialize)]
struct AnalysisResp {
    fingerprint: String,
    served_from_cache: bool,
    payload: Value,
}

/// Compute (or serve) one derived analysis for the active topic. The AI
/// reply goes through the same repair chain as admission scoring.
async fn analysis(
    State(state): State<AppState>,
    Json(body): Json<AnalysisReq>,
) -> Result<Json<AnalysisResp>, (StatusCode, String)> {
    let key = AnalysisKey {
        topic_id: state.cfg.topic_id.clone(),
        date_range: body.date_range.clone(),
        model: state.deps.ai.model_name().to_string(),
        sample_mode: body.sample_mode.clone(),
        profile_id: body.profile_id.clone(),
        view_id: body.view_id.clone(),
    };
    let fingerprint = key.fingerprint();
    let ttl = Duration::from_secs(state.cfg.cache_ttl_secs);
    let force = body.force_refresh || state.cfg.cache_force_refresh;

    let ai = Arc::clone(&state.deps.ai);
    let prompt = format!(
        "Produce a JSON analysis for topic \"{}\", view \"{}\", range {}, \
         sample mode {}. Reply with ONLY a JSON object.",
        key.topic_id, key.view_id, key.date_range, key.sample_mode
    );

    let result = state
        .cache
        .get_or_compute(&fingerprint, ttl, force, || async move {
            let raw = ai.complete(&prompt).await?;
            repair::repair(&raw)
        })
        .await;

    match result {
        Ok((payload, served_from_cache)) => Ok(Json(AnalysisResp {
            fingerprint,
            served_from_cache,
            payload,
        })),
        Err(e) => Err((StatusCode::BAD_GATEWAY, format!("analysis failed: {e}"))),
    }
}
