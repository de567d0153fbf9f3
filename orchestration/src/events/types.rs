//! Event types for orchestration sessions
//!
//! Everything a subscriber can observe: connection changes, run lifecycle,
//! per-model results, Athena recommendations and decision trace entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::athena::{AthenaState, Recommendation};
use crate::state::{CancelReason, ModelId, ModelResult, RunId, RunProgress, Strategy};
use crate::synthesis::Synthesis;
use crate::trace::DecisionEntry;
use crate::transport::{ConnectionQuality, ConnectionSnapshot};

/// All orchestration events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestraEvent {
    /// The transport link changed status
    ConnectionChanged {
        state: ConnectionSnapshot,
        timestamp: DateTime<Utc>,
    },

    /// A latency probe round trip completed
    LatencySampled {
        latency_ms: u64,
        quality: ConnectionQuality,
        timestamp: DateTime<Utc>,
    },

    /// A run was accepted and is dispatching
    RunStarted {
        run_id: RunId,
        strategy: Strategy,
        models: Vec<ModelId>,
        timestamp: DateTime<Utc>,
    },

    /// Progress update for a run
    RunProgress {
        run_id: RunId,
        progress: RunProgress,
        timestamp: DateTime<Utc>,
    },

    /// A model finished (successfully or not) within a run
    ModelResultReceived {
        run_id: RunId,
        result: ModelResult,
        timestamp: DateTime<Utc>,
    },

    /// The run produced its synthesized answer; always the last event of a
    /// completed run
    RunCompleted {
        run_id: RunId,
        synthesis: Synthesis,
        /// True when at least one model failed
        partial: bool,
        timestamp: DateTime<Utc>,
    },

    /// The run ended without a synthesized answer
    RunFailed {
        run_id: RunId,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The run was cancelled before synthesis
    RunCancelled {
        run_id: RunId,
        reason: CancelReason,
        timestamp: DateTime<Utc>,
    },

    /// Athena produced a new recommendation
    RecommendationReady {
        recommendation: Recommendation,
        timestamp: DateTime<Utc>,
    },

    /// Athena moved to a new state
    AthenaStateChanged {
        state: AthenaState,
        timestamp: DateTime<Utc>,
    },

    /// A decision was appended to the trace
    DecisionRecorded {
        entry: DecisionEntry,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestraEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            OrchestraEvent::ConnectionChanged { timestamp, .. } => *timestamp,
            OrchestraEvent::LatencySampled { timestamp, .. } => *timestamp,
            OrchestraEvent::RunStarted { timestamp, .. } => *timestamp,
            OrchestraEvent::RunProgress { timestamp, .. } => *timestamp,
            OrchestraEvent::ModelResultReceived { timestamp, .. } => *timestamp,
            OrchestraEvent::RunCompleted { timestamp, .. } => *timestamp,
            OrchestraEvent::RunFailed { timestamp, .. } => *timestamp,
            OrchestraEvent::RunCancelled { timestamp, .. } => *timestamp,
            OrchestraEvent::RecommendationReady { timestamp, .. } => *timestamp,
            OrchestraEvent::AthenaStateChanged { timestamp, .. } => *timestamp,
            OrchestraEvent::DecisionRecorded { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            OrchestraEvent::ConnectionChanged { .. } => "connection_changed",
            OrchestraEvent::LatencySampled { .. } => "latency_sampled",
            OrchestraEvent::RunStarted { .. } => "run_started",
            OrchestraEvent::RunProgress { .. } => "run_progress",
            OrchestraEvent::ModelResultReceived { .. } => "model_result_received",
            OrchestraEvent::RunCompleted { .. } => "run_completed",
            OrchestraEvent::RunFailed { .. } => "run_failed",
            OrchestraEvent::RunCancelled { .. } => "run_cancelled",
            OrchestraEvent::RecommendationReady { .. } => "recommendation_ready",
            OrchestraEvent::AthenaStateChanged { .. } => "athena_state_changed",
            OrchestraEvent::DecisionRecorded { .. } => "decision_recorded",
        }
    }

    /// Get the run ID if this event is run-scoped
    pub fn run_id(&self) -> Option<&str> {
        match self {
            OrchestraEvent::RunStarted { run_id, .. } => Some(run_id),
            OrchestraEvent::RunProgress { run_id, .. } => Some(run_id),
            OrchestraEvent::ModelResultReceived { run_id, .. } => Some(run_id),
            OrchestraEvent::RunCompleted { run_id, .. } => Some(run_id),
            OrchestraEvent::RunFailed { run_id, .. } => Some(run_id),
            OrchestraEvent::RunCancelled { run_id, .. } => Some(run_id),
            OrchestraEvent::DecisionRecorded { entry, .. } => entry.run_id.as_deref(),
            _ => None,
        }
    }

    /// Whether this event ends a run
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            OrchestraEvent::RunCompleted { .. }
                | OrchestraEvent::RunFailed { .. }
                | OrchestraEvent::RunCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunPhase;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = OrchestraEvent::RunProgress {
            run_id: "run-1".to_string(),
            progress: RunProgress::compute(1, 2, RunPhase::Collecting),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_progress");
        assert_eq!(json["progress"]["completed_models"], 1);

        let back: OrchestraEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.run_id(), Some("run-1"));
    }

    #[test]
    fn test_terminal_classification() {
        let cancelled = OrchestraEvent::RunCancelled {
            run_id: "r".to_string(),
            reason: CancelReason::Superseded,
            timestamp: Utc::now(),
        };
        assert!(cancelled.is_run_terminal());
        assert_eq!(cancelled.event_type(), "run_cancelled");
    }
}
