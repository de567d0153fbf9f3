//! Seam between the engine and whatever actually talks to models

use async_trait::async_trait;
use std::time::Duration;

use crate::state::{FailureKind, ModelFailure, ModelId, RunId};
use crate::transport::{LinkError, TransportLink, WireMessage};

/// One model invocation
#[derive(Debug, Clone)]
pub struct ModelCall {
    pub run_id: RunId,
    pub model: ModelId,
    pub prompt: String,
    /// Latest successful output of an earlier model (cascade)
    pub context: Option<String>,
    pub conversation_id: Option<String>,
}

/// Raw reply from a model; the engine fills in missing confidence and
/// token counts
#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub content: String,
    pub confidence: Option<f32>,
    pub tokens_used: Option<u32>,
}

impl ModelReply {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            confidence: None,
            tokens_used: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_tokens(mut self, tokens_used: u32) -> Self {
        self.tokens_used = Some(tokens_used);
        self
    }
}

/// Why a model call failed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connectivity: {0}")]
    Connectivity(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("run timeout reached")]
    RunTimeout,

    #[error("cancelled")]
    Cancelled,
}

impl CallError {
    /// Failure kind recorded on the result; `None` for cancellation, which
    /// never produces a result
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            CallError::Timeout(_) => Some(FailureKind::Timeout),
            CallError::Connectivity(_) => Some(FailureKind::Connectivity),
            CallError::Backend(_) => Some(FailureKind::Backend),
            CallError::Malformed(_) => Some(FailureKind::Malformed),
            CallError::RunTimeout => Some(FailureKind::RunTimeout),
            CallError::Cancelled => None,
        }
    }

    pub fn to_failure(&self) -> Option<ModelFailure> {
        self.kind().map(|kind| ModelFailure::new(kind, self.to_string()))
    }
}

impl From<LinkError> for CallError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Backend(msg) => CallError::Backend(msg),
            LinkError::UnexpectedFrame(msg) => CallError::Malformed(msg),
            other => CallError::Connectivity(other.to_string()),
        }
    }
}

/// Invokes a single model
#[async_trait]
pub trait ModelCaller: Send + Sync {
    async fn call(&self, call: ModelCall) -> Result<ModelReply, CallError>;
}

#[async_trait]
impl ModelCaller for TransportLink {
    async fn call(&self, call: ModelCall) -> Result<ModelReply, CallError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let reply = self
            .request(WireMessage::ModelRequest {
                request_id,
                model: call.model.clone(),
                prompt: call.prompt,
                context: call.context,
                conversation_id: call.conversation_id,
            })
            .await?;

        match reply {
            WireMessage::ModelResponse {
                model,
                content,
                confidence,
                tokens_used,
                ..
            } => {
                if model != call.model {
                    return Err(CallError::Malformed(format!(
                        "response for {} answered by {}",
                        call.model, model
                    )));
                }
                Ok(ModelReply {
                    content,
                    confidence,
                    tokens_used,
                })
            }
            WireMessage::ModelError { error, .. } => Err(CallError::Backend(error)),
            other => Err(CallError::Malformed(format!(
                "unexpected {} frame",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_errors_map_to_failure_kinds() {
        assert_eq!(
            CallError::from(LinkError::NotConnected).kind(),
            Some(FailureKind::Connectivity)
        );
        assert_eq!(
            CallError::from(LinkError::ConnectionLost).kind(),
            Some(FailureKind::Connectivity)
        );
        assert_eq!(
            CallError::from(LinkError::Backend("rate limited".into())).kind(),
            Some(FailureKind::Backend)
        );
        assert_eq!(CallError::Cancelled.to_failure(), None);
    }
}
