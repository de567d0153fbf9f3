//! Athena: prompt analysis and model/strategy recommendation
//!
//! Athena analyzes each prompt, recommends a model subset, strategy and
//! weights, and either applies the recommendation immediately (auto-apply)
//! or holds it until the caller approves it.
//!
//! States: `disabled → idle → analyzing → recommending → ready → applying →
//! (idle | error)`. Errors stay inside Athena; `retry_from_error` replays
//! the last prompt.

pub mod analysis;
pub mod recommend;

pub use analysis::{ComplexityTier, PromptAnalysis, PromptAnalyzer};
pub use recommend::{
    ReasoningStep, Recommendation, RecommendationPolicy, RecommendError, Recommender,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::engine::{EngineError, OrchestrationEngine, RunHandle};
use crate::events::{OrchestraEvent, SharedEventBus};
use crate::registry::SharedModelRegistry;
use crate::trace::{Decision, SharedDecisionTrace};

/// Errors surfaced by Athena
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AthenaError {
    #[error("Athena is disabled")]
    Disabled,

    #[error("Auto-apply threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f32),

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("No recommendation ready to apply")]
    NotReady,

    #[error("Nothing to retry")]
    NothingToRetry,

    #[error(transparent)]
    Recommend(#[from] RecommendError),

    #[error("Recommendation rejected by engine: {0}")]
    Apply(#[from] EngineError),
}

pub type AthenaResult<T> = std::result::Result<T, AthenaError>;

/// Athena lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AthenaState {
    Disabled,
    Idle,
    Analyzing,
    Recommending,
    Ready,
    Applying,
    Error,
}

impl std::fmt::Display for AthenaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AthenaState::Disabled => "disabled",
            AthenaState::Idle => "idle",
            AthenaState::Analyzing => "analyzing",
            AthenaState::Recommending => "recommending",
            AthenaState::Ready => "ready",
            AthenaState::Applying => "applying",
            AthenaState::Error => "error",
        };
        f.write_str(s)
    }
}

/// User-facing Athena settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AthenaSettings {
    pub enabled: bool,
    pub auto_apply: bool,
    /// Minimum overall confidence for auto-apply
    pub auto_apply_threshold: f32,
    /// Recommendations retained in history
    pub history_limit: usize,
    pub policy: RecommendationPolicy,
}

impl Default for AthenaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_apply: false,
            auto_apply_threshold: 0.75,
            history_limit: 20,
            policy: RecommendationPolicy::default(),
        }
    }
}

/// What `process` did with the recommendation
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// Submitted to the engine immediately
    AutoApplied {
        recommendation: Recommendation,
        run: RunHandle,
    },
    /// Waiting for `apply_recommendation`
    AwaitingApproval(Recommendation),
}

impl ProcessOutcome {
    pub fn recommendation(&self) -> &Recommendation {
        match self {
            ProcessOutcome::AutoApplied { recommendation, .. } => recommendation,
            ProcessOutcome::AwaitingApproval(recommendation) => recommendation,
        }
    }
}

/// Point-in-time view of Athena
#[derive(Debug, Clone, Serialize)]
pub struct AthenaStatus {
    pub state: AthenaState,
    pub settings: AthenaSettings,
    pub current: Option<Recommendation>,
    pub history_len: usize,
    pub last_error: Option<String>,
}

struct AthenaInner {
    state: AthenaState,
    settings: AthenaSettings,
    current: Option<Recommendation>,
    history: VecDeque<Recommendation>,
    last_error: Option<String>,
    last_prompt: Option<(String, Option<String>)>,
}

/// Recommendation controller bound to an engine
pub struct Athena {
    engine: Arc<OrchestrationEngine>,
    registry: SharedModelRegistry,
    bus: SharedEventBus,
    trace: SharedDecisionTrace,
    analyzer: PromptAnalyzer,
    inner: Mutex<AthenaInner>,
}

impl Athena {
    pub fn new(
        engine: Arc<OrchestrationEngine>,
        bus: SharedEventBus,
        trace: SharedDecisionTrace,
        settings: AthenaSettings,
    ) -> Self {
        let state = if settings.enabled {
            AthenaState::Idle
        } else {
            AthenaState::Disabled
        };
        Self {
            registry: Arc::clone(engine.registry()),
            engine,
            bus,
            trace,
            analyzer: PromptAnalyzer::new(),
            inner: Mutex::new(AthenaInner {
                state,
                settings,
                current: None,
                history: VecDeque::new(),
                last_error: None,
                last_prompt: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AthenaInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> AthenaState {
        self.lock().state
    }

    pub fn settings(&self) -> AthenaSettings {
        self.lock().settings.clone()
    }

    /// Recommendation awaiting approval or most recently applied
    pub fn current(&self) -> Option<Recommendation> {
        self.lock().current.clone()
    }

    /// Retained recommendations, newest first
    pub fn history(&self) -> Vec<Recommendation> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn status(&self) -> AthenaStatus {
        let inner = self.lock();
        AthenaStatus {
            state: inner.state,
            settings: inner.settings.clone(),
            current: inner.current.clone(),
            history_len: inner.history.len(),
            last_error: inner.last_error.clone(),
        }
    }

    /// Analyze a prompt without changing state
    pub fn analyze(&self, prompt: &str) -> PromptAnalysis {
        self.analyzer.analyze(prompt)
    }

    /// Analyze and recommend for a prompt, auto-applying when allowed
    pub fn process(
        &self,
        prompt: &str,
        conversation_id: Option<&str>,
    ) -> AthenaResult<ProcessOutcome> {
        let settings = {
            let mut inner = self.lock();
            if !inner.settings.enabled {
                return Err(AthenaError::Disabled);
            }
            inner.last_prompt = Some((prompt.to_string(), conversation_id.map(str::to_string)));
            self.transition(&mut inner, AthenaState::Analyzing);
            inner.settings.clone()
        };

        if prompt.trim().is_empty() {
            return Err(self.enter_error(AthenaError::EmptyPrompt));
        }

        let analysis = self.analyzer.analyze(prompt);
        debug!(summary = %analysis.summary(), "Prompt analyzed");

        self.transition_to(AthenaState::Recommending);
        let recommender = Recommender::new(settings.policy.clone());
        let recommendation = match recommender.recommend(prompt, &analysis, &self.registry) {
            Ok(recommendation) => recommendation,
            Err(e) => {
                self.trace
                    .record(Decision::athena("recommend", e.to_string()));
                return Err(self.enter_error(e.into()));
            }
        };

        for step in &recommendation.reasoning {
            self.trace.record(
                Decision::athena(step.step.clone(), step.detail.clone())
                    .for_recommendation(recommendation.id.clone()),
            );
        }

        info!(
            recommendation_id = %recommendation.id,
            strategy = %recommendation.strategy,
            models = recommendation.models.len(),
            overall_confidence = recommendation.overall_confidence,
            "Recommendation ready"
        );

        {
            let mut inner = self.lock();
            let limit = inner.settings.history_limit;
            inner.history.push_front(recommendation.clone());
            inner.history.truncate(limit);
            inner.current = Some(recommendation.clone());
            inner.last_error = None;
            self.transition(&mut inner, AthenaState::Ready);
            self.bus.publish(OrchestraEvent::RecommendationReady {
                recommendation: recommendation.clone(),
                timestamp: Utc::now(),
            });
        }

        // The active-run check and the submit are separate steps; a run
        // started in between is superseded by the auto-applied one.
        let confident = recommendation.overall_confidence >= settings.auto_apply_threshold;
        let engine_busy = self.engine.is_active();
        if settings.auto_apply && confident && !engine_busy {
            self.trace.record(
                Decision::athena(
                    "auto_apply",
                    format!(
                        "confidence {:.2} ≥ threshold {:.2}, submitting",
                        recommendation.overall_confidence, settings.auto_apply_threshold
                    ),
                )
                .for_recommendation(recommendation.id.clone()),
            );
            let run = self.apply(recommendation.clone())?;
            return Ok(ProcessOutcome::AutoApplied {
                recommendation,
                run,
            });
        }

        if settings.auto_apply {
            let reason = if !confident {
                format!(
                    "confidence {:.2} below threshold {:.2}, awaiting approval",
                    recommendation.overall_confidence, settings.auto_apply_threshold
                )
            } else {
                "a run is active, awaiting approval".to_string()
            };
            self.trace.record(
                Decision::athena("auto_apply", reason)
                    .for_recommendation(recommendation.id.clone()),
            );
        }
        Ok(ProcessOutcome::AwaitingApproval(recommendation))
    }

    /// Submit the ready recommendation to the engine
    pub fn apply_recommendation(&self) -> AthenaResult<RunHandle> {
        let recommendation = {
            let inner = self.lock();
            if !inner.settings.enabled {
                return Err(AthenaError::Disabled);
            }
            match (&inner.state, &inner.current) {
                (AthenaState::Ready, Some(rec)) => rec.clone(),
                _ => return Err(AthenaError::NotReady),
            }
        };
        self.trace.record(
            Decision::athena("apply", "recommendation approved")
                .for_recommendation(recommendation.id.clone()),
        );
        self.apply(recommendation)
    }

    fn apply(&self, recommendation: Recommendation) -> AthenaResult<RunHandle> {
        self.transition_to(AthenaState::Applying);

        let mut request = recommendation.to_request();
        if let Some((_, Some(conversation_id))) = &self.lock().last_prompt {
            request = request.with_conversation(conversation_id.clone());
        }

        match self.engine.submit(request) {
            Ok(run) => {
                self.trace.record(
                    Decision::athena("applied", format!("submitted as run {}", run.id()))
                        .for_recommendation(recommendation.id.clone())
                        .for_run(run.id().to_string()),
                );
                self.transition_to(AthenaState::Idle);
                Ok(run)
            }
            Err(e) => {
                self.trace.record(
                    Decision::athena("apply", e.to_string())
                        .for_recommendation(recommendation.id.clone()),
                );
                Err(self.enter_error(e.into()))
            }
        }
    }

    /// Flip the enabled flag. Disabling drops any pending recommendation.
    pub fn toggle_enabled(&self) -> bool {
        let mut inner = self.lock();
        inner.settings.enabled = !inner.settings.enabled;
        let enabled = inner.settings.enabled;
        if enabled {
            self.transition(&mut inner, AthenaState::Idle);
        } else {
            inner.current = None;
            self.transition(&mut inner, AthenaState::Disabled);
        }
        info!(enabled, "Athena toggled");
        enabled
    }

    pub fn toggle_auto_apply(&self) -> bool {
        let mut inner = self.lock();
        inner.settings.auto_apply = !inner.settings.auto_apply;
        info!(auto_apply = inner.settings.auto_apply, "Athena auto-apply toggled");
        inner.settings.auto_apply
    }

    pub fn set_auto_apply_threshold(&self, threshold: f32) -> AthenaResult<()> {
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(AthenaError::InvalidThreshold(threshold));
        }
        self.lock().settings.auto_apply_threshold = threshold;
        Ok(())
    }

    /// Leave the error state by replaying the last prompt
    pub fn retry_from_error(&self) -> AthenaResult<ProcessOutcome> {
        let (prompt, conversation_id) = {
            let mut inner = self.lock();
            if inner.state != AthenaState::Error {
                return Err(AthenaError::NothingToRetry);
            }
            let Some(last) = inner.last_prompt.clone() else {
                return Err(AthenaError::NothingToRetry);
            };
            inner.last_error = None;
            self.transition(&mut inner, AthenaState::Idle);
            last
        };
        info!("Retrying Athena after error");
        self.process(&prompt, conversation_id.as_deref())
    }

    pub fn clear_history(&self) {
        let mut inner = self.lock();
        inner.history.clear();
        debug!("Athena history cleared");
    }

    fn enter_error(&self, error: AthenaError) -> AthenaError {
        warn!(%error, "Athena error");
        let mut inner = self.lock();
        inner.last_error = Some(error.to_string());
        self.transition(&mut inner, AthenaState::Error);
        error
    }

    fn transition_to(&self, state: AthenaState) {
        let mut inner = self.lock();
        self.transition(&mut inner, state);
    }

    fn transition(&self, inner: &mut AthenaInner, state: AthenaState) {
        if inner.state == state {
            return;
        }
        debug!(from = %inner.state, to = %state, "Athena state");
        inner.state = state;
        self.bus.publish(OrchestraEvent::AthenaStateChanged {
            state,
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CallError, EngineConfig, ModelCall, ModelCaller, ModelReply};
    use crate::events::EventBus;
    use crate::registry::{HealthPolicy, ModelProfile, ModelRegistry};
    use crate::state::Capability;
    use crate::trace::DecisionTrace;
    use async_trait::async_trait;

    struct EchoCaller;

    #[async_trait]
    impl ModelCaller for EchoCaller {
        async fn call(&self, call: ModelCall) -> Result<ModelReply, CallError> {
            Ok(ModelReply::new(format!("{} says hi", call.model)).with_confidence(0.9))
        }
    }

    fn athena(profiles: Vec<ModelProfile>, settings: AthenaSettings) -> Athena {
        let bus = EventBus::new().shared();
        let trace = DecisionTrace::default().shared();
        let registry = ModelRegistry::from_profiles(profiles, HealthPolicy::default()).shared();
        let engine = Arc::new(OrchestrationEngine::new(
            registry,
            Arc::new(EchoCaller),
            Arc::clone(&bus),
            Arc::clone(&trace),
            EngineConfig::default(),
        ));
        Athena::new(engine, bus, trace, settings)
    }

    fn coders() -> Vec<ModelProfile> {
        vec![ModelProfile::new("coder").with_capability(Capability::Coding, 0.95)]
    }

    #[tokio::test]
    async fn test_process_waits_for_approval_by_default() {
        let athena = athena(coders(), AthenaSettings::default());
        let outcome = athena.process("Debug this Rust function", None).unwrap();

        assert!(matches!(outcome, ProcessOutcome::AwaitingApproval(_)));
        assert_eq!(athena.state(), AthenaState::Ready);
        assert_eq!(athena.history().len(), 1);

        let run = athena.apply_recommendation().unwrap();
        assert_eq!(athena.state(), AthenaState::Idle);
        let finished = run.wait().await;
        assert!(finished.synthesis.is_some());
    }

    #[tokio::test]
    async fn test_empty_prompt_enters_error_and_retry_replays() {
        let athena = athena(coders(), AthenaSettings::default());
        assert_eq!(athena.process("  ", None).unwrap_err(), AthenaError::EmptyPrompt);
        assert_eq!(athena.state(), AthenaState::Error);
        assert!(athena.status().last_error.is_some());

        // Same prompt again, so still an error
        assert!(athena.retry_from_error().is_err());
        assert_eq!(athena.state(), AthenaState::Error);
    }

    #[tokio::test]
    async fn test_empty_registry_is_an_athena_error() {
        let athena = athena(vec![], AthenaSettings::default());
        let err = athena.process("Debug this Rust function", None).unwrap_err();
        assert_eq!(err, AthenaError::Recommend(RecommendError::EmptyRegistry));
        assert_eq!(athena.state(), AthenaState::Error);
    }

    #[test]
    fn test_disabled_rejects_processing() {
        let athena = athena(
            coders(),
            AthenaSettings {
                enabled: false,
                ..Default::default()
            },
        );
        assert_eq!(athena.state(), AthenaState::Disabled);
        assert_eq!(
            athena.process("Debug this", None).unwrap_err(),
            AthenaError::Disabled
        );
        assert!(athena.toggle_enabled());
        assert_eq!(athena.state(), AthenaState::Idle);
    }

    #[test]
    fn test_threshold_validation() {
        let athena = athena(coders(), AthenaSettings::default());
        assert!(athena.set_auto_apply_threshold(0.5).is_ok());
        assert_eq!(athena.settings().auto_apply_threshold, 0.5);
        assert!(matches!(
            athena.set_auto_apply_threshold(1.5),
            Err(AthenaError::InvalidThreshold(_))
        ));
        assert!(athena.set_auto_apply_threshold(f32::NAN).is_err());
    }

    #[test]
    fn test_apply_without_recommendation() {
        let athena = athena(coders(), AthenaSettings::default());
        assert_eq!(
            athena.apply_recommendation().unwrap_err(),
            AthenaError::NotReady
        );
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_clearable() {
        let athena = athena(
            coders(),
            AthenaSettings {
                history_limit: 2,
                ..Default::default()
            },
        );
        for _ in 0..3 {
            athena.process("Debug this Rust function", None).unwrap();
        }
        assert_eq!(athena.history().len(), 2);
        athena.clear_history();
        assert!(athena.history().is_empty());
    }
}
