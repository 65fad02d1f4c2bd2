//! Content Admission Pipeline — Binary Entrypoint
//! Boots the Axum HTTP server and the recurring admission scheduler.

use std::sync::Arc;

use shuttle_axum::ShuttleAxum;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use content_admission_pipeline::api::{create_router, AppState};
use content_admission_pipeline::cache::AnalysisCache;
use content_admission_pipeline::config::PipelineConfig;
use content_admission_pipeline::metrics::Metrics;
use content_admission_pipeline::pipeline::budget::{BudgetCeilings, BudgetLedger};
use content_admission_pipeline::pipeline::providers::{NewswireConnector, RssConnector};
use content_admission_pipeline::pipeline::run_record::RunRecordStore;
use content_admission_pipeline::pipeline::scheduler::spawn_scheduler;
use content_admission_pipeline::pipeline::types::SourceConnector;
use content_admission_pipeline::pipeline::PipelineDeps;
use content_admission_pipeline::score::ai_adapter::build_client_from_config;
use content_admission_pipeline::store::InMemoryStore;

/// Enable compact tracing logs in development only.
/// Activation requires BOTH:
///   - dev environment (debug build OR SHUTTLE_ENV in {local, development, dev})
///   - ADMISSION_DEV_LOG=1
fn enable_dev_tracing() {
    let dev_flag = std::env::var("ADMISSION_DEV_LOG")
        .ok()
        .is_some_and(|v| v == "1");

    let is_dev_env = cfg!(debug_assertions)
        || matches!(
            std::env::var("SHUTTLE_ENV")
                .unwrap_or_default()
                .to_ascii_lowercase()
                .as_str(),
            "local" | "development" | "dev"
        );

    if !(dev_flag && is_dev_env) {
        return;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("admission=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn build_connectors(cfg: &PipelineConfig) -> Vec<Arc<dyn SourceConnector>> {
    let mut connectors: Vec<Arc<dyn SourceConnector>> = Vec::new();
    for feed in &cfg.rss_feeds {
        connectors.push(Arc::new(RssConnector::from_url(&feed.name, &feed.url)));
    }
    if let Some(nw) = &cfg.newswire {
        match std::env::var(&nw.api_key_env) {
            Ok(key) if !key.is_empty() => {
                connectors.push(Arc::new(NewswireConnector::from_url(
                    &nw.name,
                    &nw.base_url,
                    &key,
                )));
            }
            _ => {
                tracing::warn!(
                    provider = %nw.name,
                    key_env = %nw.api_key_env,
                    "newswire api key missing, connector not registered"
                );
            }
        }
    }
    connectors
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();

    // Initialize dev tracing early (no-op in production).
    enable_dev_tracing();

    let cfg = Arc::new(PipelineConfig::load_default().expect("failed to load pipeline config"));

    let metrics = Metrics::init(cfg.cache_ttl_secs);

    let deps = Arc::new(PipelineDeps {
        connectors: build_connectors(&cfg),
        ai: build_client_from_config(&cfg.ai, &cfg.data_dir),
        store: Arc::new(InMemoryStore::new()),
        ledger: Arc::new(BudgetLedger::with_persistence(
            BudgetCeilings {
                per_provider: cfg.provider_daily_ceiling,
                aggregate: cfg.aggregate_daily_ceiling,
            },
            cfg.data_dir.join("budget_ledger.json"),
        )),
        run_records: Arc::new(RunRecordStore::new(
            cfg.data_dir.join("run_record.json"),
            cfg.run_deadline_secs * 2,
        )),
    });

    spawn_scheduler(Arc::clone(&deps), Arc::clone(&cfg));

    let state = AppState {
        deps,
        cfg,
        cache: Arc::new(AnalysisCache::new()),
    };
    let router = create_router(state).merge(metrics.router());

    Ok(router.into())
}
