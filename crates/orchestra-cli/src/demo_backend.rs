//! Local backend speaking the orchestration wire protocol.
//!
//! Answers every model request after a fixed latency with a canned reply,
//! or with a `model_error` for models configured to fail. Useful for
//! exercising the client without real model endpoints.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use orchestration::registry::ModelProfile;
use orchestration::state::ModelId;
use orchestration::transport::wire::{self, WireMessage, MAX_FRAME_BYTES, PROTOCOL_VERSION};

#[derive(Debug, Clone)]
pub struct DemoBackendConfig {
    pub latency: Duration,
    /// Models that answer every request with an error
    pub failing: HashSet<ModelId>,
    /// Catalog reported to `list_models`
    pub models: Vec<ModelProfile>,
}

/// Accept connections on `addr` until the process is stopped
pub async fn serve(addr: &str, config: DemoBackendConfig) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind demo backend to {}", addr))?;
    info!(
        addr = %listener.local_addr()?,
        models = config.models.len(),
        failing = config.failing.len(),
        latency_ms = config.latency.as_millis() as u64,
        "Demo backend listening"
    );

    let config = Arc::new(config);
    loop {
        let (stream, peer) = listener.accept().await?;
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            debug!(%peer, "Client connected");
            if let Err(e) = handle_client(stream, config).await {
                warn!(%peer, error = %e, "Client session ended with error");
            } else {
                debug!(%peer, "Client disconnected");
            }
        });
    }
}

async fn handle_client(stream: TcpStream, config: Arc<DemoBackendConfig>) -> Result<()> {
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let (mut sink, mut lines) = framed.split();

    // Responses from request tasks funnel through one writer
    let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(64);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let line = match wire::encode(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if sink.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut in_progress: HashMap<String, JoinHandle<()>> = HashMap::new();
    while let Some(line) = lines.next().await {
        let line = line.context("Failed to read frame")?;
        if line.trim().is_empty() {
            continue;
        }
        let message = match wire::decode(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed frame");
                continue;
            }
        };
        in_progress.retain(|_, task| !task.is_finished());

        match message {
            WireMessage::Hello { client, .. } => {
                debug!(%client, "Handshake");
                let _ = out_tx
                    .send(WireMessage::Welcome {
                        protocol_version: PROTOCOL_VERSION,
                        server: "orchestra-demo-backend".to_string(),
                    })
                    .await;
            }
            WireMessage::Ping { nonce } => {
                let _ = out_tx.send(WireMessage::Pong { nonce }).await;
            }
            WireMessage::ListModels { request_id } => {
                let _ = out_tx
                    .send(WireMessage::ModelCatalog {
                        request_id,
                        models: config.models.clone(),
                    })
                    .await;
            }
            WireMessage::ModelRequest {
                request_id,
                model,
                prompt,
                context,
                ..
            } => {
                let out_tx = out_tx.clone();
                let config = Arc::clone(&config);
                let id = request_id.clone();
                let task = tokio::spawn(async move {
                    tokio::time::sleep(config.latency).await;
                    let reply = answer(&config, request_id, model, &prompt, context.as_deref());
                    let _ = out_tx.send(reply).await;
                });
                in_progress.insert(id, task);
            }
            WireMessage::Cancel { request_id } => {
                if let Some(task) = in_progress.remove(&request_id) {
                    debug!(%request_id, "Request cancelled by client");
                    task.abort();
                }
            }
            other => debug!(kind = other.kind(), "Ignoring unexpected frame"),
        }
    }

    for (_, task) in in_progress {
        task.abort();
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

fn answer(
    config: &DemoBackendConfig,
    request_id: String,
    model: ModelId,
    prompt: &str,
    context: Option<&str>,
) -> WireMessage {
    if config.failing.contains(&model) {
        return WireMessage::ModelError {
            request_id,
            error: format!("{} is configured to fail", model),
            model,
        };
    }
    if !config.models.iter().any(|p| p.id == model) {
        return WireMessage::ModelError {
            request_id,
            error: format!("unknown model {}", model),
            model,
        };
    }

    let content = match context {
        Some(previous) => format!(
            "{} refined the previous answer. {} The prompt was: {}",
            model, previous, prompt
        ),
        None => format!("{} answers: {}", model, prompt),
    };
    WireMessage::ModelResponse {
        request_id,
        content,
        confidence: Some(0.8),
        tokens_used: Some(wire::estimate_tokens(prompt) * 2),
        model,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DemoBackendConfig {
        DemoBackendConfig {
            latency: Duration::ZERO,
            failing: HashSet::from([ModelId::new("flaky")]),
            models: vec![ModelProfile::new("steady"), ModelProfile::new("flaky")],
        }
    }

    #[test]
    fn test_failing_model_answers_with_error() {
        let reply = answer(&config(), "r1".into(), ModelId::new("flaky"), "hi", None);
        assert!(matches!(reply, WireMessage::ModelError { .. }));
    }

    #[test]
    fn test_context_is_refined() {
        let reply = answer(
            &config(),
            "r1".into(),
            ModelId::new("steady"),
            "hi",
            Some("earlier"),
        );
        match reply {
            WireMessage::ModelResponse { content, .. } => assert!(content.contains("earlier")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
