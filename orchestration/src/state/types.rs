//! Core types for orchestration runs
//!
//! These types describe a single orchestration run from submission to
//! synthesis and are carried verbatim on the event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use crate::synthesis::Synthesis;

/// Unique identifier for orchestration runs
pub type RunId = String;

/// Identifier of a registered model backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ModelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Orchestration strategy. The set is closed: each variant has its own
/// dispatch topology and completion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Call every selected model at once, merge all successes
    Parallel,
    /// Parallel dispatch, merge the majority agreement cluster
    Consensus,
    /// Best-fit model first, fall through on failure
    Adaptive,
    /// Sequential refinement chain in weight order
    Cascade,
}

impl Strategy {
    pub fn all() -> &'static [Strategy] {
        &[
            Strategy::Parallel,
            Strategy::Consensus,
            Strategy::Adaptive,
            Strategy::Cascade,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Parallel => "parallel",
            Strategy::Consensus => "consensus",
            Strategy::Adaptive => "adaptive",
            Strategy::Cascade => "cascade",
        }
    }

}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "parallel" => Ok(Strategy::Parallel),
            "consensus" => Ok(Strategy::Consensus),
            "adaptive" => Ok(Strategy::Adaptive),
            "cascade" => Ok(Strategy::Cascade),
            other => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// Prompt category taxonomy, also used as the model specialization axis.
///
/// Serialized as a plain string so it can key TOML and JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    Reasoning,
    Creativity,
    Coding,
    Analysis,
    Writing,
    Math,
    Conversation,
    Safety,
}

impl Capability {
    pub fn all() -> &'static [Capability] {
        &[
            Capability::Reasoning,
            Capability::Creativity,
            Capability::Coding,
            Capability::Analysis,
            Capability::Writing,
            Capability::Math,
            Capability::Conversation,
            Capability::Safety,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Reasoning => "reasoning",
            Capability::Creativity => "creativity",
            Capability::Coding => "coding",
            Capability::Analysis => "analysis",
            Capability::Writing => "writing",
            Capability::Math => "math",
            Capability::Conversation => "conversation",
            Capability::Safety => "safety",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| format!("unknown capability '{}'", s))
    }
}

impl TryFrom<String> for Capability {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.as_str().to_string()
    }
}

/// Phase of an orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Dispatching,
    Collecting,
    Synthesizing,
    Completed,
    Error,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::Completed | RunPhase::Error | RunPhase::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunPhase::Dispatching | RunPhase::Collecting | RunPhase::Synthesizing
        )
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Collecting => "collecting",
            RunPhase::Synthesizing => "synthesizing",
            RunPhase::Completed => "completed",
            RunPhase::Error => "error",
            RunPhase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a run was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// A newer submit replaced this run
    Superseded,
    /// Explicit `cancel()` from the caller
    Requested,
}

/// Classification of a failed model call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connectivity,
    Backend,
    Malformed,
    RunTimeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Connectivity => "connectivity",
            FailureKind::Backend => "backend",
            FailureKind::Malformed => "malformed",
            FailureKind::RunTimeout => "run_timeout",
        };
        f.write_str(s)
    }
}

/// Failure detail attached to an unsuccessful [`ModelResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ModelFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ModelFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of one model call within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResult {
    /// Run this result belongs to
    pub run_id: RunId,

    /// Model that produced it
    pub model_id: ModelId,

    /// Response text (empty on failure)
    pub content: String,

    /// Model confidence in [0, 1] (0 on failure)
    pub confidence: f32,

    /// Wall-clock latency of the call
    pub latency_ms: u64,

    /// Tokens consumed
    pub tokens_used: u32,

    /// When the result was produced
    pub timestamp: DateTime<Utc>,

    /// Whether the call succeeded
    pub success: bool,

    /// Failure detail when `success` is false
    pub error: Option<ModelFailure>,
}

impl ModelResult {
    pub fn success(
        run_id: RunId,
        model_id: ModelId,
        content: String,
        confidence: f32,
        tokens_used: u32,
        latency_ms: u64,
    ) -> Self {
        Self {
            run_id,
            model_id,
            content,
            confidence: confidence.clamp(0.0, 1.0),
            latency_ms,
            tokens_used,
            timestamp: Utc::now(),
            success: true,
            error: None,
        }
    }

    pub fn failure(run_id: RunId, model_id: ModelId, error: ModelFailure, latency_ms: u64) -> Self {
        Self {
            run_id,
            model_id,
            content: String::new(),
            confidence: 0.0,
            latency_ms,
            tokens_used: 0,
            timestamp: Utc::now(),
            success: false,
            error: Some(error),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// A request to orchestrate one prompt across a model subset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub prompt: String,
    pub models: Vec<ModelId>,
    pub strategy: Strategy,
    /// Per-model weights; missing models weigh 1.0
    #[serde(default)]
    pub weights: HashMap<ModelId, f32>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Category hint from prompt analysis (drives Adaptive ordering)
    #[serde(default)]
    pub category: Option<Capability>,
}

impl OrchestrationRequest {
    pub fn new(prompt: impl Into<String>, models: Vec<ModelId>, strategy: Strategy) -> Self {
        Self {
            prompt: prompt.into(),
            models,
            strategy,
            weights: HashMap::new(),
            conversation_id: None,
            category: None,
        }
    }

    pub fn with_weight(mut self, model: impl Into<ModelId>, weight: f32) -> Self {
        self.weights.insert(model.into(), weight);
        self
    }

    pub fn with_weights(mut self, weights: HashMap<ModelId, f32>) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_category(mut self, category: Capability) -> Self {
        self.category = Some(category);
        self
    }

    /// Weight of a model, defaulting to 1.0
    pub fn weight_for(&self, model: &ModelId) -> f32 {
        self.weights.get(model).copied().unwrap_or(1.0)
    }

    /// Position of a model in the selection, used for stable tie-breaks
    pub fn position_of(&self, model: &ModelId) -> usize {
        self.models
            .iter()
            .position(|m| m == model)
            .unwrap_or(usize::MAX)
    }

    pub fn contains(&self, model: &ModelId) -> bool {
        self.models.contains(model)
    }
}

const SYNTHESIZING_PROGRESS: f32 = 0.9;

/// Progress snapshot for a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub completed_models: usize,
    pub total_models: usize,
    pub phase: RunPhase,
    /// Overall progress in [0, 1]
    pub overall_progress: f32,
}

impl RunProgress {
    pub fn compute(completed_models: usize, total_models: usize, phase: RunPhase) -> Self {
        let fraction = if total_models == 0 {
            0.0
        } else {
            completed_models.min(total_models) as f32 / total_models as f32
        };
        let overall_progress = match phase {
            RunPhase::Idle | RunPhase::Dispatching => 0.05,
            // Clamped so float rounding at 3/3 cannot overshoot synthesizing
            RunPhase::Collecting => (0.1 + 0.8 * fraction).min(SYNTHESIZING_PROGRESS),
            RunPhase::Synthesizing => SYNTHESIZING_PROGRESS,
            RunPhase::Completed | RunPhase::Error | RunPhase::Cancelled => 1.0,
        };
        Self {
            completed_models,
            total_models,
            phase,
            overall_progress,
        }
    }
}

/// One orchestration run from submit to terminal phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRun {
    pub id: RunId,
    pub request: OrchestrationRequest,
    pub strategy: Strategy,
    pub phase: RunPhase,
    /// Results in arrival order
    pub results: Vec<ModelResult>,
    pub synthesis: Option<Synthesis>,
    /// Aggregated error summary when the run ends in `Error`
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl OrchestrationRun {
    pub fn new(request: OrchestrationRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            strategy: request.strategy,
            request,
            phase: RunPhase::Dispatching,
            results: Vec::new(),
            synthesis: None,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn total_models(&self) -> usize {
        self.request.models.len()
    }

    pub fn completed_models(&self) -> usize {
        self.results.len()
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress::compute(self.completed_models(), self.total_models(), self.phase)
    }

    pub fn successes(&self) -> impl Iterator<Item = &ModelResult> {
        self.results.iter().filter(|r| r.success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ModelResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn has_result_for(&self, model: &ModelId) -> bool {
        self.results.iter().any(|r| &r.model_id == model)
    }

    /// Completed with at least one failed model
    pub fn is_partial_success(&self) -> bool {
        self.phase == RunPhase::Completed && self.failures().next().is_some()
    }

    /// Move to a terminal phase and stamp the end time
    pub fn finish(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.ended_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_round_trip_names() {
        for strategy in Strategy::all() {
            assert_eq!(strategy.as_str().parse::<Strategy>().unwrap(), *strategy);
        }
        assert!("round_robin".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_request_default_weight() {
        let request = OrchestrationRequest::new(
            "hi",
            vec![ModelId::from("a"), ModelId::from("b")],
            Strategy::Parallel,
        )
        .with_weight("a", 2.0);

        assert_eq!(request.weight_for(&ModelId::from("a")), 2.0);
        assert_eq!(request.weight_for(&ModelId::from("b")), 1.0);
        assert_eq!(request.position_of(&ModelId::from("b")), 1);
    }

    #[test]
    fn test_progress_bounds() {
        let p = RunProgress::compute(0, 3, RunPhase::Collecting);
        assert!((p.overall_progress - 0.1).abs() < 1e-6);

        let p = RunProgress::compute(3, 3, RunPhase::Collecting);
        assert!((p.overall_progress - 0.9).abs() < 1e-6);

        let p = RunProgress::compute(1, 3, RunPhase::Completed);
        assert_eq!(p.overall_progress, 1.0);
    }

    #[test]
    fn test_progress_monotone_into_synthesis() {
        for total in 1..=7 {
            let mut previous = RunProgress::compute(0, total, RunPhase::Dispatching);
            for done in 0..=total {
                let p = RunProgress::compute(done, total, RunPhase::Collecting);
                assert!(p.overall_progress >= previous.overall_progress);
                previous = p;
            }
            let synth = RunProgress::compute(total, total, RunPhase::Synthesizing);
            assert!(
                synth.overall_progress >= previous.overall_progress,
                "{} models: collecting {} > synthesizing {}",
                total,
                previous.overall_progress,
                synth.overall_progress
            );
        }
    }

    #[test]
    fn test_failure_result_has_zero_confidence() {
        let result = ModelResult::failure(
            "run".to_string(),
            ModelId::from("a"),
            ModelFailure::new(FailureKind::Timeout, "30s"),
            30_000,
        );
        assert!(!result.success);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.failure_kind(), Some(FailureKind::Timeout));
    }

    #[test]
    fn test_phase_classification() {
        assert!(RunPhase::Collecting.is_active());
        assert!(!RunPhase::Idle.is_active());
        assert!(RunPhase::Cancelled.is_terminal());
        assert!(!RunPhase::Synthesizing.is_terminal());
    }
}
