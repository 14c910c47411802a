//! Subscription registry: the bidirectional mapping between publish paths
//! and the set of subscribed clients.
//!
//! Mutations are meant to be serialized on a single logical thread per
//! server instance; this implementation enforces that with an internal
//! `tokio::sync::Mutex` rather than relying on callers to coordinate
//! externally.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
    codec::{self, Frame, Path},
    middleware::BoxFuture,
    server::client::Client,
};

/// The data sent to a newly-subscribed client immediately after a
/// successful `subscribe`, as passed to [`Registry::subscribe`].
///
/// Either a value already in hand ([`Self::Resolved`]), or a future that
/// produces one ([`Self::Deferred`]) — e.g. a handler that looks up the
/// current state for `path` asynchronously before the first `Publish` can
/// be sent. A deferred value is re-checked against the subscription at
/// resolution time: if the client has since unsubscribed, or the future
/// resolves to `None`, nothing is sent.
pub enum InitialData {
    /// No initial data will be sent.
    Absent,
    /// Already-available data, sent synchronously within `subscribe`.
    Resolved(Value),
    /// Data that resolves asynchronously; re-checked against the
    /// subscription when it resolves.
    Deferred(BoxFuture<'static, Option<Value>>),
}

impl From<Option<Value>> for InitialData {
    fn from(value: Option<Value>) -> Self { value.map_or(Self::Absent, Self::Resolved) }
}

impl From<Value> for InitialData {
    fn from(value: Value) -> Self { Self::Resolved(value) }
}

/// The bidirectional path↔client subscription map.
///
/// Cheaply cloneable: the subscriber map lives behind an `Arc`, so a
/// deferred `initial_data` resolution can hold its own handle to the
/// registry without borrowing from the `subscribe` call that spawned it.
#[derive(Default, Clone)]
pub struct Registry {
    by_path: Arc<Mutex<HashMap<Path, HashSet<Arc<Client>>>>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self { by_path: Arc::new(Mutex::new(HashMap::new())) } }

    /// Subscribe `client` to `path`.
    ///
    /// A no-op, returning `false`, if the client is already subscribed.
    /// Otherwise adds the pairing both here and to `client`'s own
    /// subscription set. If `initial_data` resolves (immediately or
    /// later) to a value, sends a `Publish(path, value)` frame to this
    /// client only; see [`InitialData`] for the resolved/deferred split.
    pub async fn subscribe(&self, client: &Arc<Client>, path: Path, initial_data: impl Into<InitialData>) -> bool {
        let added = {
            let mut by_path = self.by_path.lock().await;
            let set = by_path.entry(path.clone()).or_default();
            let inserted = set.insert(client.clone());
            if inserted {
                client.subscriptions().lock().await.insert(path.clone());
            }
            inserted
        };

        if added {
            match initial_data.into() {
                InitialData::Absent => {}
                InitialData::Resolved(data) => {
                    client.send(&codec::encode(&Frame::Publish { path, data: Some(data) }));
                }
                InitialData::Deferred(resolve) => {
                    let registry = self.clone();
                    let client = client.clone();
                    tokio::spawn(async move {
                        let Some(data) = resolve.await else { return };
                        if registry.contains(&client, &path).await {
                            client.send(&codec::encode(&Frame::Publish { path, data: Some(data) }));
                        }
                    });
                }
            }
        }

        added
    }

    /// Remove the `(client, path)` pairing if present, pruning an emptied
    /// path entry. Returns whether a change occurred.
    ///
    /// Holds `by_path`'s lock for the whole operation, including the nested
    /// mutation of `client`'s own subscription set, so no concurrent
    /// `subscribe`/`unsubscribe`/`remove_client` call can observe or act on
    /// an intermediate state — `by_path` is the single lock spec.md §5
    /// requires serializing all registry mutations on.
    pub async fn unsubscribe_client(&self, client: &Arc<Client>, path: &Path) -> bool {
        let mut by_path = self.by_path.lock().await;
        let changed = if let Some(set) = by_path.get_mut(path) {
            let removed = set.remove(client);
            if set.is_empty() {
                by_path.remove(path);
            }
            removed
        } else {
            false
        };

        if changed {
            client.subscriptions().lock().await.remove(path);
        }
        changed
    }

    /// Remove every subscriber of `path`. Returns whether a change occurred.
    ///
    /// Holds `by_path`'s lock for the whole operation; see
    /// [`Registry::unsubscribe_client`] for why.
    pub async fn unsubscribe_all(&self, path: &Path) -> bool {
        let mut by_path = self.by_path.lock().await;
        let Some(clients) = by_path.remove(path) else { return false };
        for client in &clients {
            client.subscriptions().lock().await.remove(path);
        }
        true
    }

    /// Remove every subscription belonging to `client`, across all paths.
    /// Used on client disconnect.
    ///
    /// Holds `by_path`'s lock for the whole operation — including taking the
    /// snapshot of `client`'s subscriptions — so a concurrent `subscribe`
    /// for the same client cannot add a path after the snapshot but before
    /// `by_path` is pruned, which would otherwise leave a dangling
    /// `Arc<Client>` behind in the registry. See [`Registry::unsubscribe_client`].
    pub async fn remove_client(&self, client: &Arc<Client>) {
        let mut by_path = self.by_path.lock().await;
        let mut subscriptions = client.subscriptions().lock().await;
        let paths: Vec<Path> = subscriptions.iter().cloned().collect();
        for path in &paths {
            if let Some(set) = by_path.get_mut(path) {
                set.remove(client);
                if set.is_empty() {
                    by_path.remove(path);
                }
            }
        }
        subscriptions.clear();
    }

    /// Encode a `Publish(path, data)` frame once and send it to every
    /// current subscriber of `path`. No-op if there are no subscribers.
    pub async fn publish(&self, path: Path, data: Option<Value>) {
        let subscribers: Vec<Arc<Client>> = {
            let by_path = self.by_path.lock().await;
            by_path.get(&path).map(|set| set.iter().cloned().collect()).unwrap_or_default()
        };
        if subscribers.is_empty() {
            return;
        }
        tracing::trace!(path = path.as_str(), subscribers = subscribers.len(), "publish fan-out");
        let wire = codec::encode(&Frame::Publish { path, data });
        for client in subscribers {
            client.send(&wire);
        }
    }

    /// Return whether `client` is currently subscribed to `path`. Used to
    /// re-check a deferred `initial_data` resolution against the current
    /// subscription state, and by tests asserting the bidirectional
    /// invariant.
    pub(crate) async fn contains(&self, client: &Arc<Client>, path: &Path) -> bool {
        self.by_path.lock().await.get(path).is_some_and(|set| set.contains(client))
    }
}
