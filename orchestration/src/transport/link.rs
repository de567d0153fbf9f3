//! Resilient link to the orchestration backend
//!
//! Status machine:
//!
//! ```text
//! disconnected -> connecting -> connected -> reconnecting -> connected
//!                      |                          |
//!                      +--------> error <---------+ (attempts exhausted)
//! ```
//!
//! Each established connection gets its own generation number and
//! cancellation token. Background tasks (receive loop, latency probe) only
//! act on the link while their generation is current, so a late wake-up from
//! a torn-down connection can never clobber a newer one.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::ReconnectPolicy;
use super::connection::{ConnectionSnapshot, ConnectionStatus, LatencyWindow};
use super::wire::{WireMessage, PROTOCOL_VERSION};
use super::{Connector, Endpoint, LinkChannels, LinkError, LinkResult};
use crate::events::{OrchestraEvent, SharedEventBus};
use crate::registry::ModelProfile;

/// Tuning for the transport link
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Bound on connect plus handshake
    pub connect_timeout: Duration,
    /// Interval between latency probes while connected
    pub probe_interval: Duration,
    /// Number of latency samples kept
    pub latency_window: usize,
    /// Bound on non-model requests such as discovery
    pub request_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Name sent in the `hello` frame
    pub client_name: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(2),
            latency_window: 10,
            request_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            client_name: format!("orchestration/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

struct LinkState {
    status: ConnectionStatus,
    last_error: Option<String>,
    latency: LatencyWindow,
    endpoint: Option<Endpoint>,
    reconnect_attempt: u32,
    outbound: Option<mpsc::Sender<WireMessage>>,
    /// Token for the current connection's background tasks
    session: Option<CancellationToken>,
    /// Token for the running reconnect loop, if any
    reconnect: Option<CancellationToken>,
    generation: u64,
}

impl LinkState {
    fn snapshot(&self) -> ConnectionSnapshot {
        let quality = self.latency.quality();
        let quality_score = match (self.status, quality) {
            (ConnectionStatus::Connected, Some(q)) => q.score(),
            _ => 0.0,
        };
        ConnectionSnapshot {
            status: self.status,
            endpoint: self.endpoint.as_ref().map(|e| e.to_string()),
            last_error: self.last_error.clone(),
            latency_samples: self.latency.samples(),
            average_latency_ms: self.latency.average(),
            quality,
            quality_score,
            reconnect_attempt: self.reconnect_attempt,
        }
    }
}

struct LinkInner {
    connector: Arc<dyn Connector>,
    config: LinkConfig,
    bus: SharedEventBus,
    state: Mutex<LinkState>,
    pending: Mutex<HashMap<String, oneshot::Sender<WireMessage>>>,
    pings: Mutex<HashMap<u64, Instant>>,
    next_nonce: AtomicU64,
    /// Serializes connect, disconnect and reconnect attempts
    transition: tokio::sync::Mutex<()>,
}

/// Handle to the transport link; cheap to clone
#[derive(Clone)]
pub struct TransportLink {
    inner: Arc<LinkInner>,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("status", &self.status())
            .finish()
    }
}

impl TransportLink {
    pub fn new(connector: Arc<dyn Connector>, config: LinkConfig, bus: SharedEventBus) -> Self {
        let latency = LatencyWindow::new(config.latency_window);
        Self {
            inner: Arc::new(LinkInner {
                connector,
                config,
                bus,
                state: Mutex::new(LinkState {
                    status: ConnectionStatus::Disconnected,
                    last_error: None,
                    latency,
                    endpoint: None,
                    reconnect_attempt: 0,
                    outbound: None,
                    session: None,
                    reconnect: None,
                    generation: 0,
                }),
                pending: Mutex::new(HashMap::new()),
                pings: Mutex::new(HashMap::new()),
                next_nonce: AtomicU64::new(1),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Connect and handshake. A no-op while already connected to the same
    /// endpoint.
    pub async fn connect(&self, host: &str, port: u16) -> LinkResult<()> {
        let endpoint = Endpoint::new(host, port);
        self.inner.cancel_reconnect();
        let _guard = self.inner.transition.lock().await;

        {
            let state = self.inner.state();
            if state.status == ConnectionStatus::Connected
                && state.endpoint.as_ref() == Some(&endpoint)
            {
                debug!(%endpoint, "Already connected");
                return Ok(());
            }
        }

        self.inner.teardown();
        {
            let mut state = self.inner.state();
            state.endpoint = Some(endpoint.clone());
            state.reconnect_attempt = 0;
        }
        self.inner.set_status(ConnectionStatus::Connecting, None);
        info!(%endpoint, "Connecting");

        match establish(&self.inner).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(%endpoint, error = %e, "Connect failed");
                self.inner
                    .set_status(ConnectionStatus::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    /// Close the connection. Always succeeds; stops any reconnect loop and
    /// fails pending calls.
    pub async fn disconnect(&self) {
        self.inner.cancel_reconnect();
        let _guard = self.inner.transition.lock().await;
        self.inner.teardown();
        {
            let mut state = self.inner.state();
            state.reconnect_attempt = 0;
        }
        self.inner.set_status(ConnectionStatus::Disconnected, None);
    }

    /// Reset the attempt counter and try to reconnect immediately.
    ///
    /// If the immediate attempt fails the backoff loop takes over and the
    /// error is returned.
    pub async fn reconnect(&self) -> LinkResult<()> {
        self.inner.cancel_reconnect();
        let _guard = self.inner.transition.lock().await;
        if self.inner.state().endpoint.is_none() {
            return Err(LinkError::NoEndpoint);
        }

        self.inner.teardown();
        {
            let mut state = self.inner.state();
            state.reconnect_attempt = 1;
        }
        self.inner.set_status(ConnectionStatus::Reconnecting, None);
        info!("Manual reconnect");

        match establish(&self.inner).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Manual reconnect failed, backing off");
                self.inner.state().last_error = Some(e.to_string());
                spawn_reconnect(&self.inner);
                Err(e)
            }
        }
    }

    /// Send a raw frame
    pub async fn send(&self, message: WireMessage) -> LinkResult<()> {
        let outbound = self.inner.outbound()?;
        outbound
            .send(message)
            .await
            .map_err(|_| LinkError::ConnectionLost)
    }

    /// Send a frame carrying a request id and wait for the correlated reply.
    ///
    /// Dropping the returned future sends a best-effort `cancel` frame.
    pub async fn request(&self, message: WireMessage) -> LinkResult<WireMessage> {
        let request_id = message
            .request_id()
            .ok_or_else(|| LinkError::UnexpectedFrame(message.kind().to_string()))?
            .to_string();
        let (tx, rx) = oneshot::channel();
        let outbound = self.inner.register_pending(&request_id, tx)?;
        let mut guard = PendingGuard {
            inner: &self.inner,
            request_id,
            outbound: outbound.clone(),
            armed: true,
        };

        outbound
            .send(message)
            .await
            .map_err(|_| LinkError::ConnectionLost)?;

        let reply = rx.await.map_err(|_| LinkError::ConnectionLost)?;
        guard.armed = false;
        Ok(reply)
    }

    /// Ask the backend for its model catalog
    pub async fn discover_models(&self) -> LinkResult<Vec<ModelProfile>> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let timeout = self.inner.config.request_timeout;
        let reply = tokio::time::timeout(timeout, self.request(WireMessage::ListModels { request_id }))
            .await
            .map_err(|_| LinkError::Timeout(timeout))??;

        match reply {
            WireMessage::ModelCatalog { models, .. } => {
                info!(count = models.len(), "Discovered models");
                Ok(models)
            }
            WireMessage::ModelError { error, .. } => Err(LinkError::Backend(error)),
            other => Err(LinkError::UnexpectedFrame(other.kind().to_string())),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.state().snapshot()
    }

    /// Number of requests waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.pending().len()
    }
}

impl LinkInner {
    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<WireMessage>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pings(&self) -> MutexGuard<'_, HashMap<u64, Instant>> {
        self.pings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> LinkResult<mpsc::Sender<WireMessage>> {
        let state = self.state();
        match (&state.outbound, state.status) {
            (Some(tx), ConnectionStatus::Connected) => Ok(tx.clone()),
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Park a waiter for `request_id` on the live connection. The insert
    /// happens under the state lock: a teardown clears `outbound` under that
    /// lock before draining `pending`, so the waiter is either drained or
    /// never registered.
    fn register_pending(
        &self,
        request_id: &str,
        waiter: oneshot::Sender<WireMessage>,
    ) -> LinkResult<mpsc::Sender<WireMessage>> {
        let state = self.state();
        let outbound = match (&state.outbound, state.status) {
            (Some(tx), ConnectionStatus::Connected) => tx.clone(),
            _ => return Err(LinkError::NotConnected),
        };
        self.pending().insert(request_id.to_string(), waiter);
        Ok(outbound)
    }

    fn outbound_for(&self, generation: u64) -> Option<mpsc::Sender<WireMessage>> {
        let state = self.state();
        if state.generation == generation {
            state.outbound.clone()
        } else {
            None
        }
    }

    /// Change status and publish the snapshot. Publishing happens under the
    /// state lock so subscribers see transitions in order.
    fn set_status(&self, status: ConnectionStatus, error: Option<String>) {
        let mut state = self.state();
        if let Some(error) = error {
            state.last_error = Some(error);
        }
        if state.status == status {
            return;
        }
        let previous = state.status;
        state.status = status;
        if status == ConnectionStatus::Connected {
            state.last_error = None;
            state.reconnect_attempt = 0;
        }
        info!(from = %previous, to = %status, "Link status changed");
        self.bus.publish(OrchestraEvent::ConnectionChanged {
            state: state.snapshot(),
            timestamp: Utc::now(),
        });
    }

    fn cancel_reconnect(&self) {
        if let Some(token) = self.state().reconnect.take() {
            token.cancel();
        }
    }

    /// Drop the current connection, if any, and fail every pending call
    fn teardown(&self) {
        let session = {
            let mut state = self.state();
            state.generation += 1;
            state.outbound = None;
            state.latency.clear();
            state.session.take()
        };
        if let Some(session) = session {
            session.cancel();
        }
        self.fail_pending();
        self.pings().clear();
    }

    fn fail_pending(&self) {
        let failed: Vec<_> = self.pending().drain().collect();
        if !failed.is_empty() {
            debug!(count = failed.len(), "Failing pending requests");
        }
    }

    /// Route an inbound frame from the current connection
    fn route(&self, message: WireMessage) {
        match message {
            WireMessage::Pong { nonce } => self.record_pong(nonce),
            WireMessage::Ping { nonce } => {
                if let Ok(tx) = self.outbound() {
                    let _ = tx.try_send(WireMessage::Pong { nonce });
                }
            }
            reply @ (WireMessage::ModelResponse { .. }
            | WireMessage::ModelError { .. }
            | WireMessage::ModelCatalog { .. }) => {
                let Some(id) = reply.response_id().map(str::to_string) else {
                    return;
                };
                match self.pending().remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => debug!(request_id = %id, "Dropping reply with no waiter"),
                }
            }
            other => debug!(kind = other.kind(), "Ignoring unexpected frame"),
        }
    }

    fn record_pong(&self, nonce: u64) {
        let Some(sent) = self.pings().remove(&nonce) else {
            return;
        };
        let latency_ms = sent.elapsed().as_millis() as u64;
        let mut state = self.state();
        state.latency.push(latency_ms);
        if let Some(quality) = state.latency.quality() {
            debug!(latency_ms, ?quality, "Latency sample");
            self.bus.publish(OrchestraEvent::LatencySampled {
                latency_ms,
                quality,
                timestamp: Utc::now(),
            });
        }
    }

    /// The receive loop of connection `generation` saw the stream close
    fn connection_lost(self: &Arc<Self>, generation: u64) {
        let session = {
            let mut state = self.state();
            if state.generation != generation || state.status != ConnectionStatus::Connected {
                return;
            }
            state.generation += 1;
            state.outbound = None;
            state.latency.clear();
            state.reconnect_attempt = 0;
            state.session.take()
        };
        if let Some(session) = session {
            session.cancel();
        }
        self.fail_pending();
        self.pings().clear();

        warn!("Connection lost, entering reconnect");
        self.set_status(
            ConnectionStatus::Reconnecting,
            Some(LinkError::ConnectionLost.to_string()),
        );
        spawn_reconnect(self);
    }
}

/// Removes a pending entry when the waiting call goes away
struct PendingGuard<'a> {
    inner: &'a LinkInner,
    request_id: String,
    outbound: mpsc::Sender<WireMessage>,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.request_id);
        if self.armed {
            let _ = self.outbound.try_send(WireMessage::Cancel {
                request_id: self.request_id.clone(),
            });
        }
    }
}

/// Connect, handshake and start the connection's background tasks.
/// Callers hold the transition lock.
async fn establish(inner: &Arc<LinkInner>) -> LinkResult<()> {
    let endpoint = inner.state().endpoint.clone().ok_or(LinkError::NoEndpoint)?;
    let session = CancellationToken::new();
    let timeout = inner.config.connect_timeout;

    let attempt = async {
        let LinkChannels {
            outbound,
            mut inbound,
        } = inner.connector.connect(&endpoint, session.clone()).await?;
        let server = handshake(&outbound, &mut inbound, &inner.config.client_name).await?;
        Ok::<_, LinkError>((outbound, inbound, server))
    };

    let (outbound, inbound, server) = match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(established)) => established,
        Ok(Err(e)) => {
            session.cancel();
            return Err(e);
        }
        Err(_) => {
            session.cancel();
            return Err(LinkError::Timeout(timeout));
        }
    };

    let generation = {
        let mut state = inner.state();
        state.generation += 1;
        state.outbound = Some(outbound);
        state.session = Some(session.clone());
        state.latency.clear();
        state.generation
    };
    inner.set_status(ConnectionStatus::Connected, None);
    info!(%endpoint, %server, generation, "Connected");

    spawn_session_tasks(inner, inbound, session, generation);
    Ok(())
}

async fn handshake(
    outbound: &mpsc::Sender<WireMessage>,
    inbound: &mut mpsc::Receiver<WireMessage>,
    client: &str,
) -> LinkResult<String> {
    outbound
        .send(WireMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            client: client.to_string(),
        })
        .await
        .map_err(|_| LinkError::ConnectionLost)?;

    match inbound.recv().await {
        Some(WireMessage::Welcome {
            protocol_version,
            server,
        }) => {
            if protocol_version == PROTOCOL_VERSION {
                Ok(server)
            } else {
                Err(LinkError::ProtocolMismatch {
                    expected: PROTOCOL_VERSION,
                    got: protocol_version,
                })
            }
        }
        Some(other) => Err(LinkError::Handshake(format!(
            "expected welcome, got {}",
            other.kind()
        ))),
        None => Err(LinkError::ConnectionLost),
    }
}

fn spawn_session_tasks(
    inner: &Arc<LinkInner>,
    inbound: mpsc::Receiver<WireMessage>,
    session: CancellationToken,
    generation: u64,
) {
    tokio::spawn(receive_loop(
        Arc::clone(inner),
        inbound,
        session.clone(),
        generation,
    ));
    tokio::spawn(probe_loop(Arc::clone(inner), session, generation));
}

async fn receive_loop(
    inner: Arc<LinkInner>,
    mut inbound: mpsc::Receiver<WireMessage>,
    session: CancellationToken,
    generation: u64,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = session.cancelled() => return,
            message = inbound.recv() => message,
        };
        match message {
            Some(message) => inner.route(message),
            None => break,
        }
    }
    inner.connection_lost(generation);
}

async fn probe_loop(inner: Arc<LinkInner>, session: CancellationToken, generation: u64) {
    let period = inner.config.probe_interval.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = session.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(outbound) = inner.outbound_for(generation) else {
            return;
        };
        let nonce = inner.next_nonce.fetch_add(1, Ordering::Relaxed);
        {
            // Unanswered probes older than a few periods are abandoned
            let mut pings = inner.pings();
            pings.retain(|_, sent| sent.elapsed() < period * 5);
            pings.insert(nonce, Instant::now());
        }
        if outbound.send(WireMessage::Ping { nonce }).await.is_err() {
            return;
        }
    }
}

fn spawn_reconnect(inner: &Arc<LinkInner>) {
    let token = CancellationToken::new();
    if let Some(previous) = inner.state().reconnect.replace(token.clone()) {
        previous.cancel();
    }
    tokio::spawn(reconnect_loop(Arc::clone(inner), token));
}

async fn reconnect_loop(inner: Arc<LinkInner>, token: CancellationToken) {
    let policy = inner.config.reconnect.clone();
    loop {
        if token.is_cancelled() {
            return;
        }
        let attempt = {
            let mut state = inner.state();
            state.reconnect_attempt += 1;
            state.reconnect_attempt
        };

        if attempt > policy.max_attempts {
            warn!(max_attempts = policy.max_attempts, "Reconnect attempts exhausted");
            inner.state().reconnect = None;
            inner.set_status(
                ConnectionStatus::Error,
                Some(format!(
                    "reconnect failed after {} attempts",
                    policy.max_attempts
                )),
            );
            return;
        }

        let delay = policy.jittered_delay(attempt);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting after backoff");
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let _guard = inner.transition.lock().await;
        if token.is_cancelled() {
            return;
        }
        match establish(&inner).await {
            Ok(()) => {
                info!(attempt, "Reconnected");
                inner.state().reconnect = None;
                return;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
                inner.state().last_error = Some(e.to_string());
            }
        }
    }
}
