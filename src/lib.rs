// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod admit;
pub mod api;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod retry;
pub mod score;
pub mod store;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::cache::{AnalysisCache, AnalysisKey};
pub use crate::config::PipelineConfig;
pub use crate::pipeline::run_record::{RunRecordStore, RunStatus, StageCounts};
pub use crate::pipeline::scheduler::{spawn_scheduler, trigger_run_now};
pub use crate::pipeline::types::{Candidate, DateWindow, SourceConnector};
pub use crate::pipeline::{run_cycle, PipelineDeps, RunSummary};
pub use crate::retry::RetryPolicy;
pub use crate::score::ai_adapter::{AiClient, DynAiClient, MockAiClient};
pub use crate::score::AdmissionVerdict;
pub use crate::store::{AdmittedItem, ArticleStore, InMemoryStore};
