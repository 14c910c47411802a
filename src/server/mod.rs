//! The server/dispatcher: owns the connection map, the router, and the
//! subscription registry; implements the invoke-dispatch pipeline
//! including error conversion.

pub mod cli;
pub mod client;
pub mod connection;

use std::{collections::HashMap, sync::Arc};

use rand::seq::SliceRandom;
use tokio::sync::{RwLock, broadcast};

use crate::{
    codec::{self, Frame, InvokeId, Path},
    error::{DispatchError, ErrorConverterFailure},
    middleware::{BoxedHandlerFn, Context, EmptyHandlerChain},
    registry::Registry,
    router::Router,
};
pub use crate::config::ServerConfig;
pub use client::{Client, ClientId, ReadyState};

const ID_LEN: usize = 24;
const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-";
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A server-level signal, observable by subscribing to
/// [`Server::subscribe_events`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new client completed the welcome handshake.
    Connection(Arc<Client>),
    /// A general engine or converter failure.
    Error(ErrorConverterFailure),
    /// An inbound frame failed decoding; the connection was closed.
    ParserError {
        /// The client whose connection produced the malformed frame.
        client: Arc<Client>,
        /// The raw offending message, for diagnostics.
        raw: String,
    },
    /// A handler's rejection was converted to a 500.
    InvokeError {
        /// The client that issued the failing invocation.
        client: Arc<Client>,
        /// The original error returned by the handler, before conversion.
        error: DispatchError,
        /// The original human-readable failure message.
        message: String,
    },
    /// A client's transport closed.
    Close {
        /// The client that disconnected.
        client: Arc<Client>,
        /// Human-readable close reason.
        reason: String,
    },
    /// A client's transport reported an error.
    ClientError {
        /// The client whose transport errored.
        client: Arc<Client>,
        /// Human-readable error description.
        message: String,
    },
}

/// Owns the connection map, router, and subscription registry for one
/// attachment. Created at startup, destroyed on [`Server::close`].
pub struct Server {
    config: ServerConfig,
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    router: RwLock<Router>,
    registry: Registry,
    events: broadcast::Sender<ServerEvent>,
}

impl Server {
    /// Construct a new server with the given configuration.
    #[must_use]
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            config,
            clients: RwLock::new(HashMap::new()),
            router: RwLock::new(Router::new()),
            registry: Registry::new(),
            events,
        })
    }

    /// Subscribe to server-level signals.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> { self.events.subscribe() }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Register a route pattern with its composed handler chain.
    ///
    /// # Errors
    ///
    /// Returns [`EmptyHandlerChain`] if `handlers` is empty.
    pub async fn register_route(
        &self,
        pattern: impl Into<String>,
        handlers: Vec<BoxedHandlerFn>,
    ) -> Result<(), EmptyHandlerChain> {
        self.router.write().await.register(pattern, handlers)
    }

    /// Generate a client id unique against the current clients map, retrying
    /// on collision.
    async fn generate_unique_id(&self) -> ClientId {
        loop {
            let candidate = generate_id();
            if !self.clients.read().await.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Accept a new connection: assign an id, insert into the clients map,
    /// send the welcome frame, and emit the `connection` signal.
    pub async fn accept(
        self: &Arc<Self>,
        outbound: tokio::sync::mpsc::UnboundedSender<String>,
    ) -> Arc<Client> {
        let id = self.generate_unique_id().await;
        let client = Client::new(id, outbound);
        client.set_ready_state(ReadyState::Open);
        self.clients.write().await.insert(client.id().clone(), client.clone());

        client.send(&codec::encode(&Frame::Welcome { version: self.config.protocol_version }));
        tracing::debug!(client = %client.id(), "client connected");
        self.emit(ServerEvent::Connection(client.clone()));
        client
    }

    /// Remove `client` from the clients map and tear down its subscriptions.
    /// Idempotent.
    pub async fn disconnect(&self, client: &Arc<Client>) {
        self.clients.write().await.remove(client.id());
        self.registry.remove_client(client).await;
        client.set_ready_state(ReadyState::Closed);
        tracing::debug!(client = %client.id(), "client disconnected");
    }

    /// Dispatch an inbound `Invoke` frame.
    pub async fn dispatch(self: &Arc<Self>, client: Arc<Client>, id: InvokeId, path: Path, data: Option<serde_json::Value>) {
        let matched = {
            let router = self.router.read().await;
            router.match_path(path.as_str()).map(|m| (m.pattern.to_owned(), m.params, m.splats, m.handler.clone()))
        };

        let Some((pattern, params, splats, handler)) = matched else {
            tracing::debug!(%id, path = path.as_str(), "invoke matched no route");
            client.send(&codec::encode(&Frame::Error {
                id,
                data: Some(serde_json::json!({ "status": 404, "message": "Not Found" })),
            }));
            return;
        };

        let ctx = Context { server: self.clone(), client: client.clone(), path: pattern, params, splats, body: data };

        match (handler.as_ref())(ctx).await {
            Ok(value) => {
                client.send(&codec::encode(&Frame::Result { id, data: value }));
            }
            Err(err) => self.handle_dispatch_error(&client, id, &err).await,
        }
    }

    async fn handle_dispatch_error(&self, client: &Arc<Client>, id: InvokeId, err: &DispatchError) {
        match self.config.error_converter.convert(err) {
            Ok(payload) => {
                if payload.get("status").and_then(serde_json::Value::as_u64) == Some(500) {
                    if let DispatchError::Internal(message) = err {
                        self.emit(ServerEvent::InvokeError {
                            client: client.clone(),
                            error: err.clone(),
                            message: message.clone(),
                        });
                    }
                }
                client.send(&codec::encode(&Frame::Error { id, data: Some(payload) }));
            }
            Err(failure) => {
                tracing::error!(error = %failure, "error converter itself failed");
                client.send(&codec::encode(&Frame::Error {
                    id,
                    data: Some(serde_json::json!({ "status": 500, "message": "Internal Server Error" })),
                }));
                self.emit(ServerEvent::Error(failure));
            }
        }
    }

    /// Subscribe `client` to `path`, sending `initial_data` once it
    /// resolves. See [`Registry::subscribe`] and [`crate::registry::InitialData`].
    pub async fn subscribe(
        &self,
        client: &Arc<Client>,
        path: Path,
        initial_data: impl Into<crate::registry::InitialData>,
    ) -> bool {
        self.registry.subscribe(client, path, initial_data).await
    }

    /// Unsubscribe `client` from `path`. See [`Registry::unsubscribe_client`].
    pub async fn unsubscribe_client(&self, client: &Arc<Client>, path: &Path) -> bool {
        self.registry.unsubscribe_client(client, path).await
    }

    /// Unsubscribe every client from `path`. See [`Registry::unsubscribe_all`].
    pub async fn unsubscribe_all(&self, path: &Path) -> bool { self.registry.unsubscribe_all(path).await }

    /// Publish `data` on `path` to every current subscriber.
    pub async fn publish(&self, path: Path, data: Option<serde_json::Value>) {
        self.registry.publish(path, data).await;
    }

    /// Notify the registry and emit the client-level `parserError` signal
    /// path for an inbound frame that failed decoding. The connection layer
    /// is responsible for closing the transport afterward.
    pub fn note_parser_error(&self, client: &Arc<Client>, raw: String) {
        tracing::warn!(client = %client.id(), "parser error, closing connection");
        self.emit(ServerEvent::ParserError { client: client.clone(), raw });
    }

    /// Emit the client-level `close` signal.
    pub fn note_close(&self, client: &Arc<Client>, reason: String) {
        self.emit(ServerEvent::Close { client: client.clone(), reason });
    }

    /// Emit the client-level `error` signal.
    pub fn note_client_error(&self, client: &Arc<Client>, message: String) {
        self.emit(ServerEvent::ClientError { client: client.clone(), message });
    }

    /// Shut down: request every connection's transport to close, tear down
    /// each client's subscriptions in the registry, and clear the clients
    /// map.
    ///
    /// Subscriptions are torn down here directly rather than left to each
    /// connection task's own disconnect handler, since [`Client::request_close`]
    /// only wakes a connection task that is actually polling
    /// [`Client::wait_for_close`] — an embedder driving the core without a
    /// connection task (or a task that has already exited) must not leave
    /// the registry holding a dangling `Arc<Client>` forever.
    pub async fn close(&self) {
        let mut clients = self.clients.write().await;
        for client in clients.values() {
            client.request_close();
            self.registry.remove_client(client).await;
            client.set_ready_state(ReadyState::Closed);
        }
        clients.clear();
    }
}

fn generate_id() -> ClientId {
    let mut rng = rand::thread_rng();
    let token: String = (0..ID_LEN)
        .map(|_| ID_ALPHABET.choose(&mut rng).copied().map_or('-', char::from))
        .collect();
    ClientId::new(token)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{error::InvokeError, middleware::BoxFuture};

    fn handler_returning_value(value: serde_json::Value) -> BoxedHandlerFn {
        Arc::new(move |_ctx, _next| {
            let value = value.clone();
            Box::pin(async move { Ok(Some(value)) }) as BoxFuture<'static, crate::middleware::HandlerResult>
        })
    }

    fn handler_failing_with(err: DispatchError) -> BoxedHandlerFn {
        Arc::new(move |_ctx, _next| {
            let err = err.clone();
            Box::pin(async move { Err(err) }) as BoxFuture<'static, crate::middleware::HandlerResult>
        })
    }

    #[rstest]
    #[tokio::test]
    async fn welcome_is_sent_on_accept() {
        let server = Server::new(ServerConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        server.accept(tx).await;

        let wire = rx.try_recv().unwrap();
        assert_eq!(codec::decode(&wire).unwrap(), Frame::Welcome { version: 3 });
    }

    #[rstest]
    #[tokio::test]
    async fn invoke_success_scenario() {
        let server = Server::new(ServerConfig::default());
        server.register_route("/hello", vec![handler_returning_value(json!("hi"))]).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = server.accept(tx).await;
        rx.try_recv().unwrap(); // welcome

        server
            .dispatch(client, InvokeId::new("27").unwrap(), Path::new("/hello").unwrap(), Some(json!("hi")))
            .await;

        let wire = rx.try_recv().unwrap();
        assert_eq!(wire, "2$27|\"hi\"");
    }

    #[rstest]
    #[tokio::test]
    async fn invoke_404_scenario() {
        let server = Server::new(ServerConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = server.accept(tx).await;
        rx.try_recv().unwrap();

        server
            .dispatch(client, InvokeId::new("27").unwrap(), Path::new("/hello").unwrap(), Some(json!("hi")))
            .await;

        let wire = rx.try_recv().unwrap();
        assert_eq!(
            codec::decode(&wire).unwrap(),
            Frame::Error { id: InvokeId::new("27").unwrap(), data: Some(json!({"status": 404, "message": "Not Found"})) }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn invoke_custom_error_scenario() {
        let server = Server::new(ServerConfig::default());
        server
            .register_route(
                "/hello",
                vec![handler_failing_with(DispatchError::from(InvokeError::new(527, "Custom Error")))],
            )
            .await
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = server.accept(tx).await;
        rx.try_recv().unwrap();

        server.dispatch(client, InvokeId::new("27").unwrap(), Path::new("/hello").unwrap(), None).await;

        let wire = rx.try_recv().unwrap();
        assert_eq!(
            codec::decode(&wire).unwrap(),
            Frame::Error { id: InvokeId::new("27").unwrap(), data: Some(json!({"status": 527, "message": "Custom Error"})) }
        );
    }

    #[rstest]
    #[tokio::test]
    async fn generic_failure_emits_invoke_error_signal() {
        let server = Server::new(ServerConfig::default());
        server
            .register_route("/boom", vec![handler_failing_with(DispatchError::Internal("boom".to_owned()))])
            .await
            .unwrap();
        let mut events = server.subscribe_events();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = server.accept(tx).await;
        rx.try_recv().unwrap();
        events.try_recv().unwrap(); // connection signal

        server.dispatch(client, InvokeId::new("1").unwrap(), Path::new("/boom").unwrap(), None).await;

        let wire = rx.try_recv().unwrap();
        let frame = codec::decode(&wire).unwrap();
        let Frame::Error { data: Some(payload), .. } = frame else { panic!("expected error frame") };
        assert_eq!(payload["status"], 500);

        match events.try_recv().unwrap() {
            ServerEvent::InvokeError { message, error, .. } => {
                assert_eq!(message, "boom");
                assert_eq!(error, DispatchError::Internal("boom".to_owned()));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn params_and_splats_reach_the_handler() {
        let server = Server::new(ServerConfig::default());
        let captured = Arc::new(tokio::sync::Mutex::new(None));
        let captured_clone = captured.clone();
        let handler: BoxedHandlerFn = Arc::new(move |ctx: Context, _next| {
            let captured = captured_clone.clone();
            Box::pin(async move {
                *captured.lock().await = Some((ctx.params.clone(), ctx.splats.clone()));
                Ok(None)
            }) as BoxFuture<'static, crate::middleware::HandlerResult>
        });
        server.register_route("/hello/:who/*", vec![handler]).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = server.accept(tx).await;
        rx.try_recv().unwrap();

        server
            .dispatch(client, InvokeId::new("1").unwrap(), Path::new("/hello/me/whatever").unwrap(), None)
            .await;

        let (params, splats) = captured.lock().await.clone().unwrap();
        assert_eq!(params.get("who"), Some(&"me".to_owned()));
        assert_eq!(splats, vec!["whatever".to_owned()]);
    }

    #[rstest]
    #[tokio::test]
    async fn disconnect_removes_client_and_subscriptions() {
        let server = Server::new(ServerConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = server.accept(tx).await;
        rx.try_recv().unwrap();
        server.subscribe(&client, Path::new("/hello").unwrap(), None).await;

        server.disconnect(&client).await;

        assert!(!server.clients.read().await.contains_key(client.id()));
        assert!(client.subscriptions().lock().await.is_empty());
        assert_eq!(client.ready_state(), ReadyState::Closed);
    }

    #[rstest]
    #[tokio::test]
    async fn close_tears_down_registry_and_clients() {
        let server = Server::new(ServerConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = server.accept(tx).await;
        rx.try_recv().unwrap();
        let path = Path::new("/hello").unwrap();
        server.subscribe(&client, path.clone(), None).await;

        server.close().await;

        assert!(server.clients.read().await.is_empty());
        assert!(!server.registry.contains(&client, &path).await);
        assert!(client.subscriptions().lock().await.is_empty());
        assert_eq!(client.ready_state(), ReadyState::Closed);

        server.publish(path, Some(json!("late"))).await;
        assert!(rx.try_recv().is_err());
    }

    #[rstest]
    #[tokio::test]
    async fn close_wakes_connection_tasks_waiting_on_the_client() {
        let server = Server::new(ServerConfig::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = server.accept(tx).await;
        rx.try_recv().unwrap();
        let waiter = client.clone();

        let handle = tokio::spawn(async move {
            waiter.wait_for_close().await;
        });

        server.close().await;

        handle.await.unwrap();
    }

    #[rstest]
    #[tokio::test]
    async fn error_converter_failure_falls_back_to_generic_500_and_emits_error() {
        struct AlwaysFails;
        impl crate::config::ErrorConverter for AlwaysFails {
            fn convert(
                &self,
                _error: &DispatchError,
            ) -> Result<serde_json::Value, crate::error::ErrorConverterFailure> {
                Err(crate::error::ErrorConverterFailure("converter exploded".to_owned()))
            }
        }

        let server = Server::new(ServerConfig { error_converter: Arc::new(AlwaysFails), ..ServerConfig::default() });
        server
            .register_route("/boom", vec![handler_failing_with(DispatchError::Internal("boom".to_owned()))])
            .await
            .unwrap();
        let mut events = server.subscribe_events();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = server.accept(tx).await;
        rx.try_recv().unwrap();
        events.try_recv().unwrap(); // connection signal

        server.dispatch(client, InvokeId::new("1").unwrap(), Path::new("/boom").unwrap(), None).await;

        let wire = rx.try_recv().unwrap();
        assert_eq!(
            codec::decode(&wire).unwrap(),
            Frame::Error {
                id: InvokeId::new("1").unwrap(),
                data: Some(json!({"status": 500, "message": "Internal Server Error"}))
            }
        );
        match events.try_recv().unwrap() {
            ServerEvent::Error(failure) => assert_eq!(failure.0, "converter exploded"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn generated_ids_are_unique_under_retry() {
        let server = Server::new(ServerConfig::default());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let id = server.generate_unique_id().await;
            assert!(seen.insert(id.clone()));
            server.clients.write().await.insert(
                id.clone(),
                Client::new(id, tokio::sync::mpsc::unbounded_channel().0),
            );
        }
    }
}
