//! Per-run shared state and the caller-facing run handle
//!
//! All mutations of a run go through [`RunContext`], which holds the run
//! behind one mutex and publishes events while that mutex is held. Event
//! order on the bus therefore matches the order of state changes, and once
//! a run is terminal no further result can slip in.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{OrchestraEvent, SharedEventBus};
use crate::registry::ModelRegistry;
use crate::state::{
    CancelReason, FailureKind, ModelFailure, ModelId, ModelResult, OrchestrationRequest,
    OrchestrationRun, RunId, RunPhase,
};
use crate::synthesis::Synthesis;
use crate::trace::{Decision, SharedDecisionTrace};

struct RunState {
    run: OrchestrationRun,
    /// Models with a call outstanding, keyed to their dispatch time
    in_flight: BTreeMap<ModelId, Instant>,
}

pub(crate) struct RunContext {
    pub(crate) id: RunId,
    pub(crate) request: OrchestrationRequest,
    pub(crate) cancel: CancellationToken,
    state: Mutex<RunState>,
    phase: watch::Sender<RunPhase>,
    bus: SharedEventBus,
    trace: SharedDecisionTrace,
}

impl RunContext {
    pub(crate) fn new(
        request: OrchestrationRequest,
        bus: SharedEventBus,
        trace: SharedDecisionTrace,
    ) -> Self {
        let run = OrchestrationRun::new(request.clone());
        let (phase, _) = watch::channel(run.phase);
        Self {
            id: run.id.clone(),
            request,
            cancel: CancellationToken::new(),
            state: Mutex::new(RunState {
                run,
                in_flight: BTreeMap::new(),
            }),
            phase,
            bus,
            trace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn phase(&self) -> RunPhase {
        self.lock().run.phase
    }

    pub(crate) fn snapshot(&self) -> OrchestrationRun {
        self.lock().run.clone()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.phase().is_active()
    }

    pub(crate) fn decide(&self, decision: Decision) {
        self.trace.record(decision.for_run(self.id.clone()));
    }

    /// Publish the start event; called once by the engine after the run
    /// becomes the active one
    pub(crate) fn announce(&self) {
        let state = self.lock();
        self.bus.publish(OrchestraEvent::RunStarted {
            run_id: self.id.clone(),
            strategy: self.request.strategy,
            models: self.request.models.clone(),
            timestamp: Utc::now(),
        });
        self.publish_progress(&state.run);
    }

    pub(crate) fn mark_in_flight(&self, model: &ModelId) {
        self.lock().in_flight.insert(model.clone(), Instant::now());
    }

    pub(crate) fn clear_in_flight(&self, model: &ModelId) {
        self.lock().in_flight.remove(model);
    }

    /// Append a result. Returns false when the result is dropped: the run is
    /// past collecting, the model is outside the selection, or the model
    /// already has a result.
    pub(crate) fn record(&self, result: ModelResult) -> bool {
        let mut state = self.lock();
        state.in_flight.remove(&result.model_id);

        if !matches!(state.run.phase, RunPhase::Dispatching | RunPhase::Collecting) {
            debug!(run_id = %self.id, model = %result.model_id, phase = %state.run.phase, "Dropping late result");
            return false;
        }
        if !self.request.contains(&result.model_id) {
            warn!(run_id = %self.id, model = %result.model_id, "Dropping result for unselected model");
            return false;
        }
        if state.run.has_result_for(&result.model_id) {
            warn!(run_id = %self.id, model = %result.model_id, "Dropping duplicate result");
            return false;
        }

        if state.run.phase == RunPhase::Dispatching {
            state.run.phase = RunPhase::Collecting;
            self.phase.send_replace(RunPhase::Collecting);
        }
        state.run.results.push(result.clone());

        self.bus.publish(OrchestraEvent::ModelResultReceived {
            run_id: self.id.clone(),
            result,
            timestamp: Utc::now(),
        });
        self.publish_progress(&state.run);
        true
    }

    /// Move between non-terminal phases. Returns false if the run already
    /// ended.
    pub(crate) fn set_phase(&self, phase: RunPhase) -> bool {
        let mut state = self.lock();
        if state.run.phase.is_terminal() {
            return false;
        }
        if state.run.phase == phase {
            return true;
        }
        debug!(run_id = %self.id, from = %state.run.phase, to = %phase, "Run phase");
        state.run.phase = phase;
        self.phase.send_replace(phase);
        self.publish_progress(&state.run);
        true
    }

    /// Fail every outstanding call with `kind`. Each failure counts against
    /// the model's health like any other completed call.
    pub(crate) fn fail_in_flight(
        &self,
        kind: FailureKind,
        message: &str,
        registry: &ModelRegistry,
    ) -> usize {
        let pending = std::mem::take(&mut self.lock().in_flight);
        let mut failed = 0;
        for (model, dispatched) in pending {
            let result = ModelResult::failure(
                self.id.clone(),
                model,
                ModelFailure::new(kind, message),
                dispatched.elapsed().as_millis() as u64,
            );
            registry.record_result(&result);
            if self.record(result) {
                failed += 1;
            }
        }
        failed
    }

    pub(crate) fn results(&self) -> Vec<ModelResult> {
        self.lock().run.results.clone()
    }

    /// Finish with a synthesized answer. `RunCompleted` is the last event
    /// published for the run.
    pub(crate) fn complete(&self, synthesis: Synthesis) -> bool {
        let mut state = self.lock();
        if state.run.phase.is_terminal() {
            return false;
        }
        let partial = synthesis.is_partial();
        state.run.synthesis = Some(synthesis.clone());
        state.run.finish(RunPhase::Completed);
        info!(
            run_id = %self.id,
            method = ?synthesis.method,
            confidence = synthesis.confidence,
            partial,
            "Run completed"
        );
        self.publish_progress(&state.run);
        self.bus.publish(OrchestraEvent::RunCompleted {
            run_id: self.id.clone(),
            synthesis,
            partial,
            timestamp: Utc::now(),
        });
        self.phase.send_replace(RunPhase::Completed);
        true
    }

    pub(crate) fn fail(&self, error: String) -> bool {
        let mut state = self.lock();
        if state.run.phase.is_terminal() {
            return false;
        }
        state.run.error = Some(error.clone());
        state.run.finish(RunPhase::Error);
        tracing::error!(run_id = %self.id, %error, "Run failed");
        self.publish_progress(&state.run);
        self.bus.publish(OrchestraEvent::RunFailed {
            run_id: self.id.clone(),
            error,
            timestamp: Utc::now(),
        });
        self.phase.send_replace(RunPhase::Error);
        true
    }

    /// Cancel from dispatching or collecting. Received results are
    /// discarded and in-flight calls are aborted.
    pub(crate) fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut state = self.lock();
            if !matches!(state.run.phase, RunPhase::Dispatching | RunPhase::Collecting) {
                return false;
            }
            state.run.results.clear();
            state.in_flight.clear();
            state.run.finish(RunPhase::Cancelled);
            info!(run_id = %self.id, ?reason, "Run cancelled");
            self.bus.publish(OrchestraEvent::RunCancelled {
                run_id: self.id.clone(),
                reason,
                timestamp: Utc::now(),
            });
            self.phase.send_replace(RunPhase::Cancelled);
        }
        self.cancel.cancel();
        true
    }

    fn publish_progress(&self, run: &OrchestrationRun) {
        self.bus.publish(OrchestraEvent::RunProgress {
            run_id: self.id.clone(),
            progress: run.progress(),
            timestamp: Utc::now(),
        });
    }

    fn watch_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }
}

/// Caller-facing handle to a submitted run; cheap to clone
#[derive(Clone)]
pub struct RunHandle {
    ctx: Arc<RunContext>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("id", &self.ctx.id)
            .field("phase", &self.ctx.phase())
            .finish()
    }
}

impl RunHandle {
    pub(crate) fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    pub fn id(&self) -> &str {
        &self.ctx.id
    }

    pub fn phase(&self) -> RunPhase {
        self.ctx.phase()
    }

    /// Clone of the run as it stands now
    pub fn snapshot(&self) -> OrchestrationRun {
        self.ctx.snapshot()
    }

    /// Cancel this run if it is still dispatching or collecting
    pub fn cancel(&self) -> bool {
        self.ctx.cancel(CancelReason::Requested)
    }

    /// Wait for a terminal phase and return the final run
    pub async fn wait(&self) -> OrchestrationRun {
        self.wait_until(|phase| phase.is_terminal()).await;
        self.snapshot()
    }

    /// Wait until the phase satisfies `pred`
    pub async fn wait_until(&self, pred: impl Fn(RunPhase) -> bool) -> RunPhase {
        let mut rx = self.ctx.watch_phase();
        let phase = match rx.wait_for(|phase| pred(*phase)).await {
            Ok(phase) => *phase,
            Err(_) => self.phase(),
        };
        phase
    }
}
