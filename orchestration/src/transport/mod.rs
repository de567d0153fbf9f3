//! Transport Link to the orchestration backend
//!
//! A [`TransportLink`] owns one logical connection at a time, produced by a
//! [`Connector`]. It performs the protocol handshake, samples latency,
//! correlates model requests with responses and reconnects with bounded
//! exponential backoff when the connection drops unexpectedly.

pub mod backoff;
pub mod connection;
pub mod link;
pub mod tcp;
pub mod wire;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use backoff::ReconnectPolicy;
pub use connection::{ConnectionQuality, ConnectionSnapshot, ConnectionStatus, LatencyWindow};
pub use link::{LinkConfig, TransportLink};
pub use tcp::TcpConnector;
pub use wire::{WireMessage, PROTOCOL_VERSION};

/// Errors from the transport link
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection refused by {0}")]
    Refused(String),

    #[error("Protocol mismatch: expected version {expected}, got {got}")]
    ProtocolMismatch { expected: u32, got: u32 },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Not connected")]
    NotConnected,

    #[error("No endpoint configured")]
    NoEndpoint,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type for link operations
pub type LinkResult<T> = Result<T, LinkError>;

/// Backend address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Message channels for one established connection
///
/// The inbound channel closing means the connection is gone.
pub struct LinkChannels {
    pub outbound: mpsc::Sender<WireMessage>,
    pub inbound: mpsc::Receiver<WireMessage>,
}

/// Opens raw connections for the link
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection to `endpoint`. Background I/O tasks must stop when
    /// `shutdown` is cancelled.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        shutdown: CancellationToken,
    ) -> LinkResult<LinkChannels>;
}
