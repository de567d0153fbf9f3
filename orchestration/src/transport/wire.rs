//! Wire protocol between the link and the orchestration backend
//!
//! One JSON object per line, tagged by `type`. The client opens with
//! `hello`; the backend must answer `welcome` with the same protocol version.

use serde::{Deserialize, Serialize};

use crate::registry::ModelProfile;
use crate::state::ModelId;

/// Protocol version spoken by this crate
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound for a single frame
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Frame decoding error
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// All protocol frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    Hello {
        protocol_version: u32,
        client: String,
    },
    Welcome {
        protocol_version: u32,
        #[serde(default)]
        server: String,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    ModelRequest {
        request_id: String,
        model: ModelId,
        prompt: String,
        /// Prior output to refine (cascade chains)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
    ModelResponse {
        request_id: String,
        model: ModelId,
        content: String,
        #[serde(default)]
        confidence: Option<f32>,
        #[serde(default)]
        tokens_used: Option<u32>,
    },
    ModelError {
        request_id: String,
        model: ModelId,
        error: String,
    },
    ListModels {
        request_id: String,
    },
    ModelCatalog {
        request_id: String,
        models: Vec<ModelProfile>,
    },
    Cancel {
        request_id: String,
    },
}

impl WireMessage {
    /// Frame type name as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => "hello",
            WireMessage::Welcome { .. } => "welcome",
            WireMessage::Ping { .. } => "ping",
            WireMessage::Pong { .. } => "pong",
            WireMessage::ModelRequest { .. } => "model_request",
            WireMessage::ModelResponse { .. } => "model_response",
            WireMessage::ModelError { .. } => "model_error",
            WireMessage::ListModels { .. } => "list_models",
            WireMessage::ModelCatalog { .. } => "model_catalog",
            WireMessage::Cancel { .. } => "cancel",
        }
    }

    /// Request id for frames that expect a reply
    pub fn request_id(&self) -> Option<&str> {
        match self {
            WireMessage::ModelRequest { request_id, .. }
            | WireMessage::ListModels { request_id } => Some(request_id),
            _ => None,
        }
    }

    /// Request id for frames that answer a pending request
    pub fn response_id(&self) -> Option<&str> {
        match self {
            WireMessage::ModelResponse { request_id, .. }
            | WireMessage::ModelError { request_id, .. }
            | WireMessage::ModelCatalog { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

/// Encode a frame as a single line (without the trailing newline)
pub fn encode(message: &WireMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

/// Decode a single line
pub fn decode(line: &str) -> Result<WireMessage, WireError> {
    Ok(serde_json::from_str(line.trim())?)
}

/// Extract a `[confidence: X.XX]` marker from response text
pub fn extract_confidence(content: &str) -> Option<f32> {
    let start = content.find("[confidence:")?;
    let end = content[start..].find(']')?;
    let value = &content[start + "[confidence:".len()..start + end];
    value.trim().parse::<f32>().ok().map(|c| c.clamp(0.0, 1.0))
}

/// Rough token estimate when the backend does not report usage
pub fn estimate_tokens(content: &str) -> u32 {
    (content.chars().count() / 4).max(1) as u32
}
