//! The `Client` record: one entry per live connection.
//!
//! The subscription set and ready state are behind a lock/atomic since
//! they are mutated from the registry and the connection task
//! respectively; the id and outbound channel are immutable for the
//! client's lifetime and so need no such protection.

use std::{
    collections::HashSet,
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use tokio::sync::{Mutex, Notify, mpsc};

use crate::codec::Path;

const MAX_ID_LEN: usize = 32;

/// A stable, opaque client identifier: `[A-Za-z0-9-]{1,32}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    /// Construct a [`ClientId`], validating length and character set.
    ///
    /// # Panics
    ///
    /// Panics if `raw` violates the id constraints; callers are expected to
    /// use [`crate::server::generate_id`], which always produces a valid
    /// token.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        assert!(
            !raw.is_empty()
                && raw.len() <= MAX_ID_LEN
                && raw.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-'),
            "client id must match [A-Za-z0-9-]{{1,32}}"
        );
        Self(raw)
    }

    /// Borrow the underlying token.
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// Accepted but the welcome handshake has not yet completed.
    Connecting,
    /// Open for invoke/publish traffic.
    Open,
    /// Teardown in progress.
    Closing,
    /// Fully closed; further sends are discarded.
    Closed,
}

impl ReadyState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One entry in the server's client map.
///
/// Equality and hashing are by id, matching the protocol's identity rule.
pub struct Client {
    id: ClientId,
    outbound: mpsc::UnboundedSender<String>,
    subscriptions: Mutex<HashSet<Path>>,
    ready_state: AtomicU8,
    close_signal: Notify,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("id", &self.id).field("ready_state", &self.ready_state()).finish()
    }
}

impl Client {
    /// Construct a new client wrapping the given outbound channel.
    #[must_use]
    pub fn new(id: ClientId, outbound: mpsc::UnboundedSender<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            outbound,
            subscriptions: Mutex::new(HashSet::new()),
            ready_state: AtomicU8::new(ReadyState::Connecting.as_u8()),
            close_signal: Notify::new(),
        })
    }

    /// Construct a client backed by an in-memory channel, for tests.
    #[cfg(test)]
    #[must_use]
    pub fn new_for_test() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self::new(ClientId::new("test-client"), tx);
        client.set_ready_state(ReadyState::Open);
        (client, rx)
    }

    /// This client's stable identifier.
    #[must_use]
    pub fn id(&self) -> &ClientId { &self.id }

    /// The set of paths this client is currently subscribed to.
    #[must_use]
    pub const fn subscriptions(&self) -> &Mutex<HashSet<Path>> { &self.subscriptions }

    /// Current lifecycle state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState { ReadyState::from_u8(self.ready_state.load(Ordering::Acquire)) }

    /// Transition to a new lifecycle state.
    pub fn set_ready_state(&self, state: ReadyState) { self.ready_state.store(state.as_u8(), Ordering::Release); }

    /// Request that this client's connection task tear down its transport.
    ///
    /// Transitions to [`ReadyState::Closing`] and wakes any connection task
    /// awaiting [`Client::wait_for_close`]. Used by [`crate::server::Server::close`]
    /// to actually terminate in-flight connections rather than merely
    /// forgetting about them.
    pub fn request_close(&self) {
        self.set_ready_state(ReadyState::Closing);
        self.close_signal.notify_waiters();
    }

    /// Wait until [`Client::request_close`] is called for this client.
    ///
    /// Intended to be raced inside a connection task's event loop so a
    /// server-initiated shutdown actually reaches the transport, not just
    /// the in-memory client map.
    pub async fn wait_for_close(&self) { self.close_signal.notified().await; }

    /// Send an already-encoded frame to this client.
    ///
    /// Fire-and-forget: failure of the underlying channel (the connection
    /// task has already torn down) is swallowed silently, per the
    /// connection's `send` contract. Discarded entirely once the client has
    /// transitioned to [`ReadyState::Closed`].
    pub fn send(&self, encoded_frame: &str) {
        if self.ready_state() == ReadyState::Closed {
            return;
        }
        let _ = self.outbound.send(encoded_frame.to_owned());
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool { self.id == other.id }
}

impl Eq for Client {}

impl Hash for Client {
    fn hash<H: Hasher>(&self, state: &mut H) { self.id.hash(state); }
}
