//! Orchestration data model
//!
//! Requests, runs, per-model results and the shared enums (strategy,
//! capability taxonomy, run phase) used by every other module.

pub mod types;

pub use types::{
    CancelReason, Capability, FailureKind, ModelFailure, ModelId, ModelResult,
    OrchestrationRequest, OrchestrationRun, RunId, RunPhase, RunProgress, Strategy,
};
