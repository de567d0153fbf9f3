//! Append-only log of recommendation and run decisions
//!
//! Entries are numbered with a monotonically increasing sequence. The log
//! keeps the most recent `capacity` entries; older entries fall off the
//! front but sequence numbers are never reused.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::events::{OrchestraEvent, SharedEventBus};

/// Default number of entries retained
pub const DEFAULT_TRACE_CAPACITY: usize = 1_000;

/// Which subsystem made the decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Athena,
    Engine,
}

/// One decision point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionEntry {
    pub seq: u64,
    pub source: DecisionSource,
    /// Run the decision belongs to, if any
    pub run_id: Option<String>,
    /// Recommendation the decision belongs to, if any
    pub recommendation_id: Option<String>,
    /// Short machine-friendly step name, e.g. `category` or `strategy`
    pub step: String,
    /// Human-readable justification
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Builder for a trace entry before it is numbered
#[derive(Debug, Clone)]
pub struct Decision {
    source: DecisionSource,
    step: String,
    detail: String,
    run_id: Option<String>,
    recommendation_id: Option<String>,
}

impl Decision {
    pub fn athena(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(DecisionSource::Athena, step, detail)
    }

    pub fn engine(step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(DecisionSource::Engine, step, detail)
    }

    fn new(source: DecisionSource, step: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            source,
            step: step.into(),
            detail: detail.into(),
            run_id: None,
            recommendation_id: None,
        }
    }

    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn for_recommendation(mut self, recommendation_id: impl Into<String>) -> Self {
        self.recommendation_id = Some(recommendation_id.into());
        self
    }
}

struct TraceLog {
    entries: VecDeque<DecisionEntry>,
    next_seq: u64,
}

/// Shared reference to DecisionTrace
pub type SharedDecisionTrace = Arc<DecisionTrace>;

/// Append-only decision log
pub struct DecisionTrace {
    log: Mutex<TraceLog>,
    capacity: usize,
    bus: Option<SharedEventBus>,
}

impl DecisionTrace {
    pub fn new(capacity: usize) -> Self {
        Self {
            log: Mutex::new(TraceLog {
                entries: VecDeque::new(),
                next_seq: 1,
            }),
            capacity: capacity.max(1),
            bus: None,
        }
    }

    /// Publish every recorded entry on the bus
    pub fn with_bus(mut self, bus: SharedEventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn shared(self) -> SharedDecisionTrace {
        Arc::new(self)
    }

    /// Append a decision and return the numbered entry
    pub fn record(&self, decision: Decision) -> DecisionEntry {
        let entry = {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = DecisionEntry {
                seq: log.next_seq,
                source: decision.source,
                run_id: decision.run_id,
                recommendation_id: decision.recommendation_id,
                step: decision.step,
                detail: decision.detail,
                timestamp: Utc::now(),
            };
            log.next_seq += 1;
            if log.entries.len() == self.capacity {
                log.entries.pop_front();
            }
            log.entries.push_back(entry.clone());
            entry
        };

        debug!(seq = entry.seq, step = %entry.step, "{}", entry.detail);

        if let Some(bus) = &self.bus {
            bus.publish(OrchestraEvent::DecisionRecorded {
                entry: entry.clone(),
                timestamp: entry.timestamp,
            });
        }
        entry
    }

    /// All retained entries, oldest first
    pub fn entries(&self) -> Vec<DecisionEntry> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .cloned()
            .collect()
    }

    /// Entries with a sequence number greater than `seq`
    pub fn since(&self, seq: u64) -> Vec<DecisionEntry> {
        self.filtered(|e| e.seq > seq)
    }

    pub fn for_run(&self, run_id: &str) -> Vec<DecisionEntry> {
        self.filtered(|e| e.run_id.as_deref() == Some(run_id))
    }

    pub fn for_recommendation(&self, recommendation_id: &str) -> Vec<DecisionEntry> {
        self.filtered(|e| e.recommendation_id.as_deref() == Some(recommendation_id))
    }

    pub fn len(&self) -> usize {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn filtered(&self, pred: impl Fn(&DecisionEntry) -> bool) -> Vec<DecisionEntry> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }
}

impl Default for DecisionTrace {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    #[test]
    fn test_sequence_is_monotonic() {
        let trace = DecisionTrace::default();
        let a = trace.record(Decision::athena("category", "coding"));
        let b = trace.record(Decision::engine("dispatch", "3 models").for_run("run-1"));

        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(trace.for_run("run-1").len(), 1);
        assert_eq!(trace.since(1).len(), 1);
    }

    #[test]
    fn test_capacity_drops_oldest_without_reusing_seq() {
        let trace = DecisionTrace::new(2);
        for i in 0..4 {
            trace.record(Decision::engine("step", format!("decision {}", i)));
        }

        let entries = trace.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 3);
        assert_eq!(entries[1].seq, 4);
    }

    #[tokio::test]
    async fn test_entries_are_published() {
        let bus = EventBus::new().shared();
        let mut rx = bus.subscribe();
        let trace = DecisionTrace::default().with_bus(bus);

        trace.record(Decision::athena("strategy", "parallel").for_recommendation("rec-1"));

        match rx.recv().await.unwrap() {
            OrchestraEvent::DecisionRecorded { entry, .. } => {
                assert_eq!(entry.recommendation_id.as_deref(), Some("rec-1"));
            }
            other => panic!("unexpected event {:?}", other.event_type()),
        }
    }
}
