//! Orchestration Engine
//!
//! Accepts one [`OrchestrationRequest`](crate::state::OrchestrationRequest)
//! at a time, drives it through a strategy executor, records every model
//! result and finishes with a synthesized answer.
//!
//! ```text
//! submit ──► dispatching ──► collecting ──► synthesizing ──► completed
//!                 │               │               │
//!                 └──► cancelled ◄┘               └──► error
//! ```

pub mod caller;
pub mod orchestrator;
pub mod run;
mod strategy;

use std::time::Duration;

use crate::synthesis::SynthesisConfig;

pub use caller::{CallError, ModelCall, ModelCaller, ModelReply};
pub use orchestrator::OrchestrationEngine;
pub use run::RunHandle;

/// Errors returned synchronously by the engine
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on a single model call
    pub call_timeout: Duration,
    /// Bound on a whole run; pending calls fail with `run_timeout`
    pub run_timeout: Option<Duration>,
    /// Confidence assumed when a reply carries none
    pub default_confidence: f32,
    pub synthesis: SynthesisConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            run_timeout: Some(Duration::from_secs(120)),
            default_confidence: 0.7,
            synthesis: SynthesisConfig::default(),
        }
    }
}
