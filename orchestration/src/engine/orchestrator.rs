//! The orchestration engine: validates requests, owns the active run and
//! drives it from dispatch to synthesis

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use super::caller::ModelCaller;
use super::run::{RunContext, RunHandle};
use super::strategy::{self, StrategyEnv};
use super::{EngineConfig, EngineError, EngineResult};
use crate::athena::analysis::PromptAnalyzer;
use crate::events::SharedEventBus;
use crate::registry::SharedModelRegistry;
use crate::state::{CancelReason, FailureKind, OrchestrationRequest, RunPhase};
use crate::synthesis::synthesize;
use crate::trace::{Decision, SharedDecisionTrace};

/// Runs one orchestration at a time; a new submit supersedes the active run
pub struct OrchestrationEngine {
    env: Arc<StrategyEnv>,
    bus: SharedEventBus,
    trace: SharedDecisionTrace,
    /// Single writer for the active-run pointer
    active: Mutex<Option<Arc<RunContext>>>,
}

impl OrchestrationEngine {
    pub fn new(
        registry: SharedModelRegistry,
        caller: Arc<dyn ModelCaller>,
        bus: SharedEventBus,
        trace: SharedDecisionTrace,
        config: EngineConfig,
    ) -> Self {
        Self {
            env: Arc::new(StrategyEnv {
                caller,
                registry,
                analyzer: PromptAnalyzer::new(),
                config,
            }),
            bus,
            trace,
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.env.config
    }

    pub fn registry(&self) -> &SharedModelRegistry {
        &self.env.registry
    }

    fn active(&self) -> MutexGuard<'_, Option<Arc<RunContext>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate and start a run, cancelling any run still in flight.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, request: OrchestrationRequest) -> EngineResult<RunHandle> {
        self.validate(&request)?;

        let ctx = Arc::new(RunContext::new(
            request,
            Arc::clone(&self.bus),
            Arc::clone(&self.trace),
        ));

        {
            let mut active = self.active();
            if let Some(previous) = active.take() {
                if previous.cancel(CancelReason::Superseded) {
                    previous.decide(Decision::engine(
                        "superseded",
                        format!("cancelled by newer run {}", ctx.id),
                    ));
                }
            }
            *active = Some(Arc::clone(&ctx));
            ctx.announce();
        }

        info!(
            run_id = %ctx.id,
            strategy = %ctx.request.strategy,
            models = ctx.request.models.len(),
            "Run submitted"
        );
        ctx.decide(Decision::engine(
            "run_start",
            format!(
                "{} over [{}]",
                ctx.request.strategy,
                ctx.request
                    .models
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        ));

        tokio::spawn(drive(Arc::clone(&ctx), Arc::clone(&self.env)));
        Ok(RunHandle::new(ctx))
    }

    /// Cancel the active run. Returns false when nothing was cancellable.
    pub fn cancel(&self) -> bool {
        let active = self.active();
        match active.as_ref() {
            Some(ctx) if ctx.cancel(CancelReason::Requested) => {
                ctx.decide(Decision::engine("cancelled", "cancel requested"));
                true
            }
            _ => false,
        }
    }

    /// Whether a run is dispatching, collecting or synthesizing
    pub fn is_active(&self) -> bool {
        self.active().as_ref().is_some_and(|ctx| ctx.is_active())
    }

    /// Handle to the most recent run, active or not
    pub fn current_run(&self) -> Option<RunHandle> {
        self.active().as_ref().map(|ctx| RunHandle::new(Arc::clone(ctx)))
    }

    fn validate(&self, request: &OrchestrationRequest) -> EngineResult<()> {
        let invalid = |msg: String| Err(EngineError::InvalidRequest(msg));

        if request.prompt.trim().is_empty() {
            return invalid("prompt is empty".to_string());
        }
        if request.models.is_empty() {
            return invalid("no models selected".to_string());
        }

        let mut seen = HashSet::new();
        for model in &request.models {
            if !seen.insert(model) {
                return invalid(format!("duplicate model {}", model));
            }
            if !self.env.registry.contains(model) {
                return invalid(format!("unknown model {}", model));
            }
        }

        for (model, weight) in &request.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return invalid(format!("invalid weight {} for {}", weight, model));
            }
            if !request.contains(model) {
                return invalid(format!("weight names unselected model {}", model));
            }
        }
        Ok(())
    }
}

/// Drive a run from dispatch to a terminal phase
async fn drive(ctx: Arc<RunContext>, env: Arc<StrategyEnv>) {
    let execution = strategy::execute(&ctx, &env);

    let timed_out = match env.config.run_timeout {
        Some(limit) => tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            outcome = tokio::time::timeout(limit, execution) => outcome.is_err(),
        },
        None => tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            _ = execution => false,
        },
    };

    if timed_out {
        let limit = env.config.run_timeout.unwrap_or_default();
        let failed = ctx.fail_in_flight(
            FailureKind::RunTimeout,
            &format!("run timeout of {:?} reached", limit),
            &env.registry,
        );
        warn!(run_id = %ctx.id, failed, "Run timeout reached");
        ctx.decide(Decision::engine(
            "run_timeout",
            format!("{} pending call(s) failed after {:?}", failed, limit),
        ));
    }

    if !ctx.set_phase(RunPhase::Synthesizing) {
        return;
    }

    let results = ctx.results();
    match synthesize(&results, &ctx.request, &env.config.synthesis) {
        Ok(synthesis) => {
            ctx.decide(Decision::engine(
                "synthesis",
                format!(
                    "{:?} from {} contributor(s), {} succeeded, {} failed, confidence {:.2}",
                    synthesis.method,
                    synthesis.contributors.len(),
                    synthesis.succeeded,
                    synthesis.failed,
                    synthesis.confidence
                ),
            ));
            ctx.complete(synthesis);
        }
        Err(e) => {
            ctx.decide(Decision::engine("synthesis", e.to_string()));
            ctx.fail(e.to_string());
        }
    }
}
