// src/score/ai_adapter.rs
//! AI scoring collaborator: provider abstraction + daily call limit.
//!
//! The AI service is an opaque text channel. Providers return raw completion
//! text; all structure is recovered downstream by the repair engine. The
//! daily limit is a separate budget from the provider fan-out ledger and is
//! persisted next to the other pipeline state.

use std::collections::VecDeque;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};

/// Trait object used by the scoring stage and the analysis cache.
#[async_trait]
pub trait AiClient: Send + Sync {
    /// Send a prompt, return the raw completion text. No structure is
    /// guaranteed; callers go through the repair engine.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Model identifier recorded on verdicts.
    fn model_name(&self) -> &str;
}

pub type DynAiClient = Arc<dyn AiClient>;

/// AI collaborator configuration, one section of the pipeline config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    pub enabled: bool,
    /// "openai" is the only real provider wired today.
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Per-day call ceiling; defaults to 200 if absent.
    pub daily_limit: Option<u32>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: None,
            model: None,
            daily_limit: Some(200),
        }
    }
}

/// Factory: build a client according to config and environment.
///
/// * If `AI_TEST_MODE=mock`, returns a deterministic mock client.
/// * Else if `config.enabled == false`, returns a disabled client.
/// * Else builds the real provider wrapped with the daily limit.
pub fn build_client_from_config(config: &AiConfig, state_dir: &Path) -> DynAiClient {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Arc::new(MockAiClient::fixed(
            r#"{"score": 0.7, "pass": true, "reason": "mock verdict"}"#,
        ));
    }

    if !config.enabled {
        return Arc::new(DisabledClient);
    }

    match config.provider.as_deref() {
        Some("openai") => {
            let provider = OpenAiClient::new(config.model.as_deref());
            Arc::new(LimitedClient::new(
                provider,
                state_dir.join("ai_daily_count.json"),
                config.daily_limit.unwrap_or(200),
            ))
        }
        _ => Arc::new(DisabledClient),
    }
}

// ------------------------------------------------------------
// Concrete providers
// ------------------------------------------------------------

/// OpenAI provider (Chat Completions API). Requires `OPENAI_API_KEY`.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(model_override: Option<&str>) -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        let http = reqwest::Client::builder()
            .user_agent("content-admission-pipeline/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        let model = model_override.unwrap_or("gpt-4o-mini").to_string();
        Self {
            http,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(anyhow!("OPENAI_API_KEY not set"));
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let req = Req {
            model: &self.model,
            messages: vec![Msg {
                role: "user",
                content: prompt,
            }],
            temperature: 0.1,
            max_tokens: 400,
        };

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("ai completion request")?
            .error_for_status()
            .context("ai completion status")?;

        let body: Resp = resp.json().await.context("ai completion body")?;
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(anyhow!("ai completion returned no content"));
        }
        Ok(content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Always errors; used when AI is disabled. The scoring stage fails closed.
pub struct DisabledClient;

#[async_trait]
impl AiClient for DisabledClient {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(anyhow!("ai scoring disabled by configuration"))
    }
    fn model_name(&self) -> &str {
        "disabled"
    }
}

/// Mock client for tests and local runs: returns a fixed response, or a
/// scripted sequence followed by the fallback.
pub struct MockAiClient {
    queue: Mutex<VecDeque<String>>,
    fallback: String,
}

impl MockAiClient {
    pub fn fixed(response: &str) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: response.to_string(),
        }
    }

    pub fn sequence(responses: Vec<String>, fallback: &str) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
            fallback: fallback.to_string(),
        }
    }
}

#[async_trait]
impl AiClient for MockAiClient {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        let mut q = self.queue.lock().expect("mock queue mutex poisoned");
        Ok(q.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }
    fn model_name(&self) -> &str {
        "mock"
    }
}

// ------------------------------------------------------------
// Daily limit wrapper
// ------------------------------------------------------------

/// Wraps a provider with a persisted per-day call ceiling. Real calls only
/// increment the counter on success; denied calls return an error and the
/// scoring stage fails closed for the affected item.
pub struct LimitedClient<C: AiClient> {
    inner: C,
    counter_path: PathBuf,
    daily_limit: u32,
    counter: Mutex<DailyCounter>,
}

impl<C: AiClient> LimitedClient<C> {
    pub fn new(inner: C, counter_path: PathBuf, daily_limit: u32) -> Self {
        let counter = Mutex::new(load_daily_counter(&counter_path).unwrap_or_default());
        Self {
            inner,
            counter_path,
            daily_limit,
            counter,
        }
    }
}

#[async_trait]
impl<C: AiClient> AiClient for LimitedClient<C> {
    async fn complete(&self, prompt: &str) -> Result<String> {
        {
            let mut g = self.counter.lock().expect("ai counter mutex poisoned");
            if g.is_expired() {
                g.reset_to_today();
                let _ = save_daily_counter(&self.counter_path, &g);
            }
            if g.count >= self.daily_limit {
                counter!("ai_limit_denied_total").increment(1);
                return Err(anyhow!("ai daily call limit reached"));
            }
        }

        let out = self.inner.complete(prompt).await?;

        counter!("ai_calls_total").increment(1);
        let mut g = self.counter.lock().expect("ai counter mutex poisoned");
        g.count = g.count.saturating_add(1);
        let _ = save_daily_counter(&self.counter_path, &g);
        Ok(out)
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DailyCounter {
    date: String,
    count: u32,
}

impl Default for DailyCounter {
    fn default() -> Self {
        Self {
            date: today(),
            count: 0,
        }
    }
}

impl DailyCounter {
    fn is_expired(&self) -> bool {
        self.date != today()
    }
    fn reset_to_today(&mut self) {
        self.date = today();
        self.count = 0;
    }
}

/// Days since UNIX epoch, stringified. Equality is all the rollover needs.
fn today() -> String {
    let days = chrono::Utc::now().timestamp().max(0) / 86_400;
    days.to_string()
}

fn load_daily_counter(path: &Path) -> Option<DailyCounter> {
    let s = fs::read_to_string(path).ok()?;
    serde_json::from_str(&s).ok()
}

fn save_daily_counter(path: &Path, dc: &DailyCounter) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let s = serde_json::to_string(dc).unwrap_or_else(|_| "{}".to_string());
    let mut f = fs::File::create(&tmp)?;
    f.write_all(s.as_bytes())?;
    fs::rename(tmp, path)?;
    Ok(())
}
