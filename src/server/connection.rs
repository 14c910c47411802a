//! Connection: wraps one accepted transport socket.
//!
//! Owns decode of inbound frames, dispatch of `Invoke` frames to the
//! [`Server`], and lifecycle signal emission. Generic over a small
//! [`Transport`] trait so the same task loop drives a real WebSocket in
//! production and an in-memory fake in tests, decoupling the dispatch
//! logic from any particular transport implementation.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::{
    codec::{self, Frame},
    server::{Server, client::Client},
};

/// An inbound or outbound failure reported by a transport adapter.
#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

/// The seam a transport adapter must fill: ordered, reliable,
/// message-framed delivery of UTF-8 strings.
#[async_trait]
pub trait Transport: Send {
    /// Wait for the next inbound message, or `None` on clean close.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Send an already-encoded frame.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the underlying send fails.
    async fn send(&mut self, message: String) -> Result<(), TransportError>;

    /// Close the transport.
    async fn close(&mut self);
}

/// Drive one connection's lifecycle to completion: accept, read/dispatch
/// loop, and teardown on close, error, or shutdown.
///
/// Spawned as one task per accepted socket by the binary's accept loop.
pub async fn run<T: Transport>(server: std::sync::Arc<Server>, mut transport: T, mut shutdown: watch::Receiver<bool>) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let client = server.accept(outbound_tx).await;
    let mut clean_close = false;

    loop {
        tokio::select! {
            biased;

            () = async { let _ = shutdown.changed().await; } => {
                break;
            }
            () = client.wait_for_close() => {
                break;
            }
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else { break };
                if transport.send(message).await.is_err() {
                    break;
                }
            }
            inbound = transport.recv() => {
                match inbound {
                    None => {
                        clean_close = true;
                        break;
                    }
                    Some(Err(TransportError(message))) => {
                        server.note_client_error(&client, message);
                        break;
                    }
                    Some(Ok(raw)) => {
                        if handle_inbound(&server, &client, &raw).await.is_break() {
                            break;
                        }
                    }
                }
            }
        }
    }

    transport.close().await;
    server.disconnect(&client).await;
    if clean_close {
        server.note_close(&client, "transport closed".to_owned());
    }
}

async fn handle_inbound(server: &std::sync::Arc<Server>, client: &std::sync::Arc<Client>, raw: &str) -> std::ops::ControlFlow<()> {
    match codec::decode(raw) {
        Ok(Frame::Invoke { id, path, data }) => {
            server.dispatch(client.clone(), id, path, data).await;
            std::ops::ControlFlow::Continue(())
        }
        Ok(_other) => {
            // The server role never expects Result/Error/Welcome/Publish
            // frames inbound; log and drop rather than treat as fatal.
            tracing::trace!(client = %client.id(), "ignoring non-invoke frame from client");
            std::ops::ControlFlow::Continue(())
        }
        Err(_parser_error) => {
            server.note_parser_error(client, raw.to_owned());
            std::ops::ControlFlow::Break(())
        }
    }
}
