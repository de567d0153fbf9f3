//! TCP connector speaking newline-delimited JSON

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::wire::{self, WireMessage, MAX_FRAME_BYTES};
use super::{Connector, Endpoint, LinkChannels, LinkError, LinkResult};

const CHANNEL_DEPTH: usize = 64;

/// Production connector over `tokio::net::TcpStream`
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        shutdown: CancellationToken,
    ) -> LinkResult<LinkChannels> {
        let addr = endpoint.to_string();
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
        {
            Err(_) => return Err(LinkError::Timeout(self.connect_timeout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(LinkError::Refused(addr))
            }
            Ok(Err(e)) => return Err(LinkError::Io(e.to_string())),
            Ok(Ok(stream)) => stream,
        };
        let _ = stream.set_nodelay(true);

        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
        let (mut sink, mut lines) = framed.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<WireMessage>(CHANNEL_DEPTH);

        // Either half ending stops the other; the link's own token is left alone
        let io = shutdown.child_token();

        // Writer: drains outbound frames until shutdown or the link drops the sender
        let writer_shutdown = io.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    message = out_rx.recv() => match message {
                        Some(m) => m,
                        None => break,
                    },
                };
                let line = match wire::encode(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    warn!(error = %e, "TCP write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            writer_shutdown.cancel();
        });

        // Reader: forwards decoded frames; dropping in_tx signals connection loss
        let reader_shutdown = io;
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    line = lines.next() => line,
                };
                match line {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match wire::decode(&line) {
                            Ok(message) => {
                                if in_tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Ignoring malformed frame"),
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "TCP read failed");
                        break;
                    }
                    None => {
                        debug!("TCP stream closed by peer");
                        break;
                    }
                }
            }
            reader_shutdown.cancel();
        });

        Ok(LinkChannels {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
