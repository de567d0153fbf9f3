//! Shared fixtures for integration tests: a scripted model caller and an
//! in-memory connector backed by a fake backend task.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use orchestration::engine::{CallError, EngineConfig, ModelCall, ModelCaller, ModelReply};
use orchestration::registry::{HealthPolicy, ModelProfile, ModelRegistry};
use orchestration::state::{Capability, ModelId};
use orchestration::transport::{
    Connector, Endpoint, LinkChannels, LinkError, LinkResult, WireMessage, PROTOCOL_VERSION,
};
use orchestration::{
    DecisionTrace, EventBus, OrchestraEvent, OrchestrationEngine, SharedDecisionTrace,
    SharedEventBus, SharedModelRegistry,
};

// ── Scripted caller ──────────────────────────────────────────────────────────

/// How a scripted model behaves
#[derive(Debug, Clone)]
pub enum Script {
    Reply {
        content: String,
        confidence: f32,
        delay: Duration,
    },
    Fail {
        error: CallError,
        delay: Duration,
    },
    /// Never answers
    Hang,
}

impl Script {
    pub fn reply(content: &str, confidence: f32) -> Self {
        Script::Reply {
            content: content.to_string(),
            confidence,
            delay: Duration::from_millis(5),
        }
    }

    pub fn reply_after(content: &str, confidence: f32, delay: Duration) -> Self {
        Script::Reply {
            content: content.to_string(),
            confidence,
            delay,
        }
    }

    pub fn fail(error: CallError) -> Self {
        Script::Fail {
            error,
            delay: Duration::from_millis(5),
        }
    }
}

/// Model caller answering from a per-model script and recording every call
#[derive(Default)]
pub struct ScriptedCaller {
    scripts: Mutex<HashMap<ModelId, Script>>,
    calls: Mutex<Vec<ModelCall>>,
}

impl ScriptedCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, model: &str, script: Script) -> Self {
        self.set(model, script);
        self
    }

    pub fn set(&self, model: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(ModelId::new(model), script);
    }

    pub fn calls(&self) -> Vec<ModelCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called_models(&self) -> Vec<ModelId> {
        self.calls().into_iter().map(|c| c.model).collect()
    }
}

#[async_trait]
impl ModelCaller for ScriptedCaller {
    async fn call(&self, call: ModelCall) -> Result<ModelReply, CallError> {
        let script = self.scripts.lock().unwrap().get(&call.model).cloned();
        self.calls.lock().unwrap().push(call.clone());

        match script {
            Some(Script::Reply {
                content,
                confidence,
                delay,
            }) => {
                tokio::time::sleep(delay).await;
                Ok(ModelReply::new(content).with_confidence(confidence))
            }
            Some(Script::Fail { error, delay }) => {
                tokio::time::sleep(delay).await;
                Err(error)
            }
            Some(Script::Hang) => std::future::pending().await,
            None => Err(CallError::Backend(format!("no script for {}", call.model))),
        }
    }
}

// ── Engine fixture ───────────────────────────────────────────────────────────

pub struct EngineFixture {
    pub engine: Arc<OrchestrationEngine>,
    pub registry: SharedModelRegistry,
    pub bus: SharedEventBus,
    pub trace: SharedDecisionTrace,
    pub caller: Arc<ScriptedCaller>,
}

pub fn profiles(models: &[&str]) -> Vec<ModelProfile> {
    models
        .iter()
        .map(|m| {
            ModelProfile::new(*m)
                .with_capability(Capability::Coding, 0.8)
                .with_capability(Capability::Conversation, 0.7)
        })
        .collect()
}

pub fn engine_fixture(
    profiles: Vec<ModelProfile>,
    caller: ScriptedCaller,
    config: EngineConfig,
) -> EngineFixture {
    let bus = EventBus::new().shared();
    let trace = DecisionTrace::default().with_bus(Arc::clone(&bus)).shared();
    let registry = ModelRegistry::from_profiles(profiles, HealthPolicy::default()).shared();
    let caller = Arc::new(caller);
    let engine = Arc::new(OrchestrationEngine::new(
        Arc::clone(&registry),
        Arc::clone(&caller) as Arc<dyn ModelCaller>,
        Arc::clone(&bus),
        Arc::clone(&trace),
        config,
    ));
    EngineFixture {
        engine,
        registry,
        bus,
        trace,
        caller,
    }
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        call_timeout: Duration::from_millis(200),
        run_timeout: Some(Duration::from_secs(5)),
        ..EngineConfig::default()
    }
}

/// Receive events until `pred` matches or `limit` elapses
pub async fn collect_until(
    rx: &mut broadcast::Receiver<OrchestraEvent>,
    limit: Duration,
    pred: impl Fn(&OrchestraEvent) -> bool,
) -> Vec<OrchestraEvent> {
    let mut events = Vec::new();
    let _ = tokio::time::timeout(limit, async {
        while let Ok(event) = rx.recv().await {
            let done = pred(&event);
            events.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    events
}

// ── In-memory connector ──────────────────────────────────────────────────────

/// Fake backend behaviour shared by every connection
pub struct FakeBackend {
    pub protocol_version: AtomicU32,
    pub refuse: AtomicBool,
    pub reply_delay: Mutex<HashMap<ModelId, Duration>>,
    pub failing: Mutex<HashSet<ModelId>>,
    pub catalog: Mutex<Vec<ModelProfile>>,
    pub connections: AtomicUsize,
    pub cancels: AtomicUsize,
    /// Cancelled by `kill` to drop the live connection
    live: Mutex<CancellationToken>,
}

impl FakeBackend {
    pub fn new(catalog: Vec<ModelProfile>) -> Arc<Self> {
        Arc::new(Self {
            protocol_version: AtomicU32::new(PROTOCOL_VERSION),
            refuse: AtomicBool::new(false),
            reply_delay: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            catalog: Mutex::new(catalog),
            connections: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            live: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn set_delay(&self, model: &str, delay: Duration) {
        self.reply_delay
            .lock()
            .unwrap()
            .insert(ModelId::new(model), delay);
    }

    pub fn set_failing(&self, model: &str) {
        self.failing.lock().unwrap().insert(ModelId::new(model));
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Drop the live connection as if the backend went away
    pub fn kill(&self) {
        self.live.lock().unwrap().cancel();
    }

    fn answer(&self, request_id: String, model: ModelId, prompt: &str) -> WireMessage {
        if self.failing.lock().unwrap().contains(&model) {
            return WireMessage::ModelError {
                request_id,
                model,
                error: "scripted failure".to_string(),
            };
        }
        WireMessage::ModelResponse {
            request_id,
            content: format!("{} answers {}", model, prompt),
            confidence: Some(0.8),
            tokens_used: Some(10),
            model,
        }
    }
}

pub struct MemoryConnector {
    pub backend: Arc<FakeBackend>,
}

impl MemoryConnector {
    pub fn new(backend: Arc<FakeBackend>) -> Arc<Self> {
        Arc::new(Self { backend })
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        shutdown: CancellationToken,
    ) -> LinkResult<LinkChannels> {
        if self.backend.refuse.load(Ordering::SeqCst) {
            return Err(LinkError::Refused(endpoint.to_string()));
        }
        self.backend.connections.fetch_add(1, Ordering::SeqCst);

        let (client_tx, from_client) = mpsc::channel(64);
        let (to_client, client_rx) = mpsc::channel(64);
        let live = CancellationToken::new();
        *self.backend.live.lock().unwrap() = live.clone();

        tokio::spawn(serve(
            Arc::clone(&self.backend),
            from_client,
            to_client,
            live,
            shutdown,
        ));
        Ok(LinkChannels {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}

async fn serve(
    backend: Arc<FakeBackend>,
    mut from_client: mpsc::Receiver<WireMessage>,
    to_client: mpsc::Sender<WireMessage>,
    live: CancellationToken,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = live.cancelled() => break,
            _ = shutdown.cancelled() => break,
            message = from_client.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };

        match message {
            WireMessage::Hello { .. } => {
                let _ = to_client
                    .send(WireMessage::Welcome {
                        protocol_version: backend.protocol_version.load(Ordering::SeqCst),
                        server: "fake".to_string(),
                    })
                    .await;
            }
            WireMessage::Ping { nonce } => {
                let _ = to_client.send(WireMessage::Pong { nonce }).await;
            }
            WireMessage::ListModels { request_id } => {
                let models = backend.catalog.lock().unwrap().clone();
                let _ = to_client
                    .send(WireMessage::ModelCatalog { request_id, models })
                    .await;
            }
            WireMessage::ModelRequest {
                request_id,
                model,
                prompt,
                ..
            } => {
                let delay = backend
                    .reply_delay
                    .lock()
                    .unwrap()
                    .get(&model)
                    .copied()
                    .unwrap_or(Duration::from_millis(5));
                let reply = backend.answer(request_id, model, &prompt);
                let to_client = to_client.clone();
                let live = live.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = live.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            let _ = to_client.send(reply).await;
                        }
                    }
                });
            }
            WireMessage::Cancel { .. } => {
                backend.cancels.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}
