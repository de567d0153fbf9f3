//! Fan-out of [`OrchestraEvent`]s to every interested listener
//!
//! Live listeners hang off a tokio broadcast channel. A bounded ring of the
//! latest events lets a listener that attaches late catch up.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::OrchestraEvent;

/// Per-listener lag allowed before a receiver sees `Lagged`
pub const CHANNEL_CAPACITY: usize = 256;

/// Ring size for late listeners
pub const REPLAY_CAPACITY: usize = 512;

pub type SharedEventBus = Arc<EventBus>;

pub struct EventBus {
    sender: broadcast::Sender<OrchestraEvent>,

    /// Oldest at the front
    recent: Mutex<VecDeque<OrchestraEvent>>,

    replay_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY, REPLAY_CAPACITY)
    }

    /// A `replay_capacity` of zero disables the ring
    pub fn with_capacity(channel_capacity: usize, replay_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            sender,
            recent: Mutex::new(VecDeque::with_capacity(replay_capacity)),
            replay_capacity,
        }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Record `event` in the ring, then hand it to live listeners
    pub fn publish(&self, event: OrchestraEvent) {
        let event_type = event.event_type();

        if self.replay_capacity > 0 {
            let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
            if recent.len() == self.replay_capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        match self.sender.send(event) {
            Ok(listeners) => debug!(event_type, listeners, "Orchestra event"),
            Err(_) => debug!(event_type, "Orchestra event dropped, nobody listening"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestraEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the ring, oldest first
    pub fn recent(&self) -> Vec<OrchestraEvent> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn replay(&self, filter: &EventFilter) -> Vec<OrchestraEvent> {
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Narrows a stream to one run and/or a set of event type tags.
/// Unset fields accept everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub run_id: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events with no run id never pass a run filter
    pub fn run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    /// Tags as returned by [`OrchestraEvent::event_type`]
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    pub fn matches(&self, event: &OrchestraEvent) -> bool {
        if let Some(ref rid) = self.run_id {
            if event.run_id() != Some(rid.as_str()) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Broadcast receiver that silently skips events its filter rejects
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<OrchestraEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<OrchestraEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Waits for the next accepted event; lag and close errors pass through
    pub async fn recv(&mut self) -> Result<OrchestraEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

pub trait EventBusExt {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CancelReason, ModelId, Strategy};
    use chrono::Utc;

    fn started(run_id: &str) -> OrchestraEvent {
        OrchestraEvent::RunStarted {
            run_id: run_id.to_string(),
            strategy: Strategy::Parallel,
            models: vec![ModelId::from("a")],
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_listener_sees_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert!(bus.has_subscribers());

        bus.publish(started("run-1"));
        assert_eq!(rx.recv().await.unwrap().run_id(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_every_listener_gets_a_copy() {
        let bus = EventBus::new().shared();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(started("run-7"));
        for rx in [&mut first, &mut second] {
            assert_eq!(rx.recv().await.unwrap().event_type(), "run_started");
        }
    }

    #[test]
    fn test_filter_needs_both_run_and_type() {
        let filter = EventFilter::new()
            .run("run-1")
            .types(vec!["run_started", "run_completed"]);

        let other_run = started("run-2");
        let wrong_type = OrchestraEvent::RunCancelled {
            run_id: "run-1".to_string(),
            reason: CancelReason::Requested,
            timestamp: Utc::now(),
        };

        assert!(filter.matches(&started("run-1")));
        assert!(!filter.matches(&other_run));
        assert!(!filter.matches(&wrong_type));
    }

    #[test]
    fn test_ring_keeps_only_the_latest_events() {
        let bus = EventBus::with_capacity(8, 3);
        for i in 0..5 {
            bus.publish(started(&format!("run-{}", i)));
        }

        let recent = bus.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].run_id(), Some("run-2"));
        assert_eq!(recent[2].run_id(), Some("run-4"));

        let only_three = bus.replay(&EventFilter::new().run("run-3"));
        assert_eq!(only_three.len(), 1);
    }

    #[tokio::test]
    async fn test_filtered_receiver_skips_other_runs() {
        let bus = EventBus::new().shared();
        let mut filtered = bus.subscribe_filtered(EventFilter::new().run("target"));

        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish(started("other"));
            publisher.publish(started("target"));
        });

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.run_id(), Some("target"));
    }
}
