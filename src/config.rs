// src/config.rs
//! Pipeline configuration: a TOML file with env-var overrides for the knobs
//! operators tune most often. Read-only to the pipeline core.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::score::ai_adapter::AiConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/pipeline.toml";
pub const ENV_CONFIG_PATH: &str = "ADMISSION_CONFIG_PATH";
pub const ENV_RELEVANCE_THRESHOLD: &str = "ADMISSION_RELEVANCE_THRESHOLD";
pub const ENV_CHECK_INTERVAL: &str = "ADMISSION_CHECK_INTERVAL_SECS";
pub const ENV_DATA_DIR: &str = "ADMISSION_DATA_DIR";

#[derive(Debug, Clone, Deserialize)]
pub struct RssFeedConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewswireConfig {
    pub name: String,
    pub base_url: String,
    /// Name of the env var holding the API key.
    pub api_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub topic_id: String,
    pub keywords: Vec<String>,

    pub check_interval_secs: u64,
    pub date_window_days: u64,
    pub relevance_threshold: f32,
    pub quality_control_enabled: bool,
    pub max_items_per_run: usize,
    pub scoring_concurrency: usize,

    pub cache_ttl_secs: u64,
    pub cache_force_refresh: bool,
    pub dedup_lookback_secs: u64,

    pub run_deadline_secs: u64,
    pub provider_timeout_secs: u64,
    pub retry_backoff_ms: u64,

    /// Per-provider daily request ceiling. 0 = unlimited.
    pub provider_daily_ceiling: u64,
    /// Aggregate daily ceiling across providers. 0 = unlimited.
    pub aggregate_daily_ceiling: u64,

    pub data_dir: PathBuf,

    pub ai: AiConfig,
    pub rss_feeds: Vec<RssFeedConfig>,
    pub newswire: Option<NewswireConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topic_id: "general".into(),
            keywords: Vec::new(),
            check_interval_secs: 900,
            date_window_days: 7,
            relevance_threshold: 0.6,
            quality_control_enabled: true,
            max_items_per_run: 50,
            scoring_concurrency: 4,
            cache_ttl_secs: 24 * 3600,
            cache_force_refresh: false,
            dedup_lookback_secs: 7 * 24 * 3600,
            run_deadline_secs: 300,
            provider_timeout_secs: 20,
            retry_backoff_ms: 500,
            provider_daily_ceiling: 200,
            aggregate_daily_ceiling: 500,
            data_dir: PathBuf::from("data"),
            ai: AiConfig::default(),
            rss_feeds: Vec::new(),
            newswire: None,
        }
    }
}

impl PipelineConfig {
    /// Load using env var + fallbacks:
    /// 1) $ADMISSION_CONFIG_PATH
    /// 2) config/pipeline.toml
    /// 3) built-in defaults
    /// Env overrides are applied on top in every case.
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            Self::load_from(Path::new(&p))?
        } else {
            let fallback = Path::new(DEFAULT_CONFIG_PATH);
            if fallback.exists() {
                Self::load_from(fallback)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        cfg.normalize();
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        let mut cfg: Self = toml::from_str(&content)
            .with_context(|| format!("parsing pipeline config {}", path.display()))?;
        cfg.normalize();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = parse_env_f32(ENV_RELEVANCE_THRESHOLD) {
            self.relevance_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = parse_env_u64(ENV_CHECK_INTERVAL) {
            self.check_interval_secs = v.max(1);
        }
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
    }

    fn normalize(&mut self) {
        use std::collections::BTreeSet;
        let mut set = BTreeSet::new();
        for kw in self.keywords.drain(..) {
            let t = kw.trim().to_lowercase();
            if !t.is_empty() {
                set.insert(t);
            }
        }
        self.keywords = set.into_iter().collect();
        self.relevance_threshold = self.relevance_threshold.clamp(0.0, 1.0);
    }
}

fn parse_env_f32(name: &str) -> Option<f32> {
    std::env::var(name).ok()?.trim().parse::<f32>().ok()
}

fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse::<u64>().ok()
}
