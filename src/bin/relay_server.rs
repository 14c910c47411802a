//! `relay-server`: a thin binary wrapper wiring [`nydus_relay::Server`] to a
//! real TCP listener upgraded to WebSocket connections via
//! `tokio-tungstenite`.
//!
//! Accept loop with graceful shutdown: a `watch`-channel shutdown signal,
//! a `JoinSet` of per-connection tasks, and SIGTERM/ctrl-c handling on
//! unix.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nydus_relay::{
    config::ServerConfig,
    server::{
        Server,
        cli::AppConfig,
        connection::{Transport, TransportError},
    },
};
use tokio::{net::TcpListener, sync::watch, task::JoinSet};
use tokio_tungstenite::tungstenite::Message;

/// Adapts a `tokio-tungstenite` WebSocket stream to [`Transport`].
struct WebSocketTransport {
    inner: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.inner.next().await {
                None => return None,
                Some(Ok(Message::Text(text))) => return Some(Ok(text)),
                Some(Ok(Message::Close(_))) => return None,
                Some(Ok(_)) => continue, // binary/ping/pong frames carry no protocol meaning here
                Some(Err(e)) => return Some(Err(TransportError(e.to_string()))),
            }
        }
    }

    async fn send(&mut self, message: String) -> Result<(), TransportError> {
        self.inner.send(Message::Text(message)).await.map_err(|e| TransportError(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        async fn shutdown_signal() {
            use tokio::signal::unix::{SignalKind, signal};
            let Ok(mut term) = signal(SignalKind::terminate()) else { return };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
    } else {
        async fn shutdown_signal() {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let AppConfig { bind, protocol_version, dev_mode } = AppConfig::load_from_iter(std::env::args())?;

    let server = Server::new(ServerConfig {
        error_converter: Arc::new(nydus_relay::config::DefaultErrorConverter { dev_mode }),
        protocol_version,
    });

    let listener = TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "relay-server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut join_set = JoinSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let server = server.clone();
                        let rx = shutdown_rx.clone();
                        join_set.spawn(async move {
                            match tokio_tungstenite::accept_async(socket).await {
                                Ok(ws) => {
                                    let transport = WebSocketTransport { inner: ws };
                                    nydus_relay::server::connection::run(server, transport, rx).await;
                                }
                                Err(e) => tracing::warn!(%peer, error = %e, "websocket handshake failed"),
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "accept error"),
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    server.close().await;
    while let Some(res) = join_set.join_next().await {
        if let Err(e) = res {
            tracing::warn!(error = %e, "connection task panicked");
        }
    }
    Ok(())
}
