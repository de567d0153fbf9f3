//! Multi-Model Orchestration Library
//!
//! This library provides:
//! - A resilient transport link to a model backend (handshake, latency
//!   probes, request correlation, reconnect with backoff)
//! - A model registry with capability profiles and live health
//! - An orchestration engine running one prompt across several models with
//!   the parallel, consensus, adaptive or cascade strategy
//! - Synthesis of per-model results into one answer
//! - Athena, which analyzes prompts and recommends models, strategy and
//!   weights, optionally applying the recommendation itself
//! - A decision trace and an event bus for observers
//!
//! # Usage
//!
//! ```ignore
//! use orchestration::{OrchestraConfig, OrchestraSession};
//!
//! let session = OrchestraSession::new(OrchestraConfig::from_env()?);
//! session.connect().await?;
//! let outcome = session.athena().process("Explain borrow checking", None)?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod athena;
pub mod config;
pub mod engine;
pub mod events;
pub mod registry;
pub mod session;
pub mod state;
pub mod synthesis;
pub mod trace;
pub mod transport;

pub use athena::{
    Athena, AthenaError, AthenaSettings, AthenaState, ComplexityTier, ProcessOutcome,
    PromptAnalysis, PromptAnalyzer, Recommendation,
};
pub use config::{ConfigError, OrchestraConfig, RegistrySource};
pub use engine::{
    CallError, EngineConfig, EngineError, ModelCall, ModelCaller, ModelReply,
    OrchestrationEngine, RunHandle,
};
pub use events::{EventBus, EventFilter, OrchestraEvent, SharedEventBus};
pub use registry::{HealthPolicy, HealthStatus, ModelProfile, ModelRegistry, SharedModelRegistry};
pub use session::{OrchestraSession, SessionError};
pub use state::{
    Capability, FailureKind, ModelId, ModelResult, OrchestrationRequest, OrchestrationRun,
    RunPhase, Strategy,
};
pub use synthesis::{MergeMethod, Synthesis, SynthesisError};
pub use trace::{Decision, DecisionEntry, DecisionTrace, SharedDecisionTrace};
pub use transport::{
    ConnectionQuality, ConnectionSnapshot, ConnectionStatus, Connector, LinkConfig, LinkError,
    TcpConnector, TransportLink,
};
