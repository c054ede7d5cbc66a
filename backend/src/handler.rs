//! Relay protocol handler.
//!
//! This module implements the `ProtocolHandler` trait for incoming iroh
//! connections. Each connection gets a fresh [`ConnectionId`], speaks
//! newline-delimited JSON events, and is wired to the shared [`Engine`] and
//! [`Hub`].

use std::sync::Arc;

use anyhow::Result;
use futures_lite::future::Boxed as BoxFuture;
use iroh::endpoint::Connection;
use iroh::protocol::ProtocolHandler;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::hub::Hub;
use crate::protocol::{ClientEvent, ConnectionId, ErrorReason, ServerEvent};

/// The relay protocol handler.
#[derive(Debug, Clone)]
pub struct RelayHandler {
    engine: Arc<Engine>,
    hub: Hub,
}

impl RelayHandler {
    /// Create a new relay handler.
    pub fn new(engine: Arc<Engine>, hub: Hub) -> Self {
        Self { engine, hub }
    }

    /// Handle a single iroh connection.
    async fn handle_connection(&self, conn: Connection) -> Result<()> {
        let remote_node_id = conn.remote_node_id()?;
        info!(?remote_node_id, "New connection");

        // Accept a bidirectional stream for the protocol
        let (send, recv) = conn.accept_bi().await?;
        let mut reader = BufReader::new(recv);

        // Read and discard the init message that opened the stream
        let mut init_line = String::new();
        reader.read_line(&mut init_line).await?;
        debug!(?remote_node_id, "Received init message");

        let conn_id = ConnectionId::generate();
        debug!(?remote_node_id, %conn_id, "Assigned connection id");

        self.serve_stream(conn_id, reader, send).await
    }

    /// Run the relay protocol for one connection over any line-oriented stream.
    ///
    /// Registers the connection, pumps events until the reader hits EOF or the
    /// writer fails, then unregisters it. Cleanup runs on every exit path.
    pub async fn serve_stream<R, W>(
        &self,
        conn_id: ConnectionId,
        reader: R,
        mut writer: W,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut outbox = self.hub.attach(conn_id.clone());
        self.hub.deliver(self.engine.connect(&conn_id));

        // `next_line` keeps partial input buffered when the outbox wins a select
        let mut lines = reader.lines();
        let result = self
            .pump(&conn_id, &mut lines, &mut writer, &mut outbox)
            .await;

        self.hub.detach(&conn_id);
        self.hub.deliver(self.engine.disconnect(&conn_id));
        info!(%conn_id, "Connection handler finished");

        result
    }

    async fn pump<R, W>(
        &self,
        conn_id: &ConnectionId,
        lines: &mut Lines<R>,
        writer: &mut W,
        outbox: &mut mpsc::Receiver<ServerEvent>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                // Events addressed to this connection
                Some(event) = outbox.recv() => {
                    if let Err(e) = send_event(writer, &event).await {
                        warn!(%conn_id, "Failed to send event: {}", e);
                        break;
                    }
                }

                // Events from the client
                result = lines.next_line() => {
                    let line = match result {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            debug!(%conn_id, "Connection closed");
                            break;
                        }
                        Err(e) => {
                            error!(%conn_id, "Read error: {}", e);
                            break;
                        }
                    };

                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<ClientEvent>(trimmed) {
                        Ok(event) => {
                            self.hub.deliver(self.engine.handle(conn_id, event));
                        }
                        Err(e) => {
                            warn!(%conn_id, "Invalid message: {}", e);
                            let error = ServerEvent::Error(ErrorReason::InvalidMessage);
                            if let Err(e) = send_event(writer, &error).await {
                                warn!(%conn_id, "Failed to send error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Write one event as a JSON line.
async fn send_event<W>(writer: &mut W, event: &ServerEvent) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(event)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

impl ProtocolHandler for RelayHandler {
    fn accept(&self, conn: Connection) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move { this.handle_connection(conn).await })
    }
}
