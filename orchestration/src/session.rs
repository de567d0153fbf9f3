//! Session façade: one configuration in, a fully wired orchestrator out
//!
//! Builds the event bus, decision trace, model registry, transport link,
//! engine and Athena, and hands out shared references to each.

use std::sync::Arc;
use tracing::info;

use crate::athena::Athena;
use crate::config::{OrchestraConfig, RegistrySource};
use crate::engine::{ModelCaller, OrchestrationEngine};
use crate::events::{EventBus, SharedEventBus};
use crate::registry::{ModelRegistry, SharedModelRegistry};
use crate::trace::{DecisionTrace, SharedDecisionTrace};
use crate::transport::{Connector, LinkError, TcpConnector, TransportLink};

/// Errors from session-level operations
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Backend reported no models")]
    NoModelsDiscovered,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A wired orchestration session
pub struct OrchestraSession {
    config: OrchestraConfig,
    bus: SharedEventBus,
    trace: SharedDecisionTrace,
    registry: SharedModelRegistry,
    link: TransportLink,
    engine: Arc<OrchestrationEngine>,
    athena: Arc<Athena>,
}

impl OrchestraSession {
    /// Session talking to the backend over TCP
    pub fn new(config: OrchestraConfig) -> Self {
        let connector = Arc::new(TcpConnector::new(config.link_config().connect_timeout));
        Self::with_connector(config, connector)
    }

    /// Session over an injected connector
    pub fn with_connector(config: OrchestraConfig, connector: Arc<dyn Connector>) -> Self {
        let bus = EventBus::with_capacity(
            config.events.channel_capacity,
            config.events.replay_capacity,
        )
        .shared();
        let link = TransportLink::new(connector, config.link_config(), Arc::clone(&bus));
        Self::assemble(config, bus, link, None)
    }

    /// Session whose engine calls models through `caller` instead of the
    /// link. The link still exists for connection management.
    pub fn with_caller(
        config: OrchestraConfig,
        connector: Arc<dyn Connector>,
        caller: Arc<dyn ModelCaller>,
    ) -> Self {
        let bus = EventBus::with_capacity(
            config.events.channel_capacity,
            config.events.replay_capacity,
        )
        .shared();
        let link = TransportLink::new(connector, config.link_config(), Arc::clone(&bus));
        Self::assemble(config, bus, link, Some(caller))
    }

    fn assemble(
        config: OrchestraConfig,
        bus: SharedEventBus,
        link: TransportLink,
        caller: Option<Arc<dyn ModelCaller>>,
    ) -> Self {
        let trace = DecisionTrace::new(config.events.trace_capacity)
            .with_bus(Arc::clone(&bus))
            .shared();
        let registry = ModelRegistry::from_profiles(
            config.registry.initial_profiles(),
            config.health.clone(),
        )
        .shared();
        let caller: Arc<dyn ModelCaller> = match caller {
            Some(caller) => caller,
            None => Arc::new(link.clone()),
        };
        let engine = Arc::new(OrchestrationEngine::new(
            Arc::clone(&registry),
            caller,
            Arc::clone(&bus),
            Arc::clone(&trace),
            config.engine_config(),
        ));
        let athena = Arc::new(Athena::new(
            Arc::clone(&engine),
            Arc::clone(&bus),
            Arc::clone(&trace),
            config.athena.clone(),
        ));

        Self {
            config,
            bus,
            trace,
            registry,
            link,
            engine,
            athena,
        }
    }

    /// Connect to the configured backend. With discovery as the registry
    /// source, the backend's catalog is registered. Returns the number of
    /// newly registered models.
    pub async fn connect(&self) -> SessionResult<usize> {
        self.link
            .connect(&self.config.link.host, self.config.link.port)
            .await?;

        if self.config.registry.source != RegistrySource::Discovery {
            return Ok(0);
        }

        let profiles = self.link.discover_models().await?;
        if profiles.is_empty() {
            return Err(SessionError::NoModelsDiscovered);
        }
        let discovered = profiles.len();
        let added = profiles
            .into_iter()
            .filter(|profile| self.registry.register(profile.clone()))
            .count();
        info!(discovered, added, "Registered discovered models");
        Ok(added)
    }

    pub async fn disconnect(&self) {
        self.link.disconnect().await;
    }

    pub fn config(&self) -> &OrchestraConfig {
        &self.config
    }

    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    pub fn trace(&self) -> &SharedDecisionTrace {
        &self.trace
    }

    pub fn registry(&self) -> &SharedModelRegistry {
        &self.registry
    }

    pub fn link(&self) -> &TransportLink {
        &self.link
    }

    pub fn engine(&self) -> &Arc<OrchestrationEngine> {
        &self.engine
    }

    pub fn athena(&self) -> &Arc<Athena> {
        &self.athena
    }
}
