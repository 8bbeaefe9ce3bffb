//! Bounded sets of streaming clients, one per broadcast channel.

use crate::module::ConnectionId;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Number of clients tracked per channel unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = 64;

/// Payloads queued per client before further broadcasts to it are dropped.
pub const OUTBOUND_BUFFER: usize = 16;

/// The two streaming channels a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Receives the push payload once per tick.
    Time,
    /// Receives nothing; closed by the host after each reload.
    Reload,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Time => f.write_str("time"),
            Channel::Reload => f.write_str("reload"),
        }
    }
}

/// Creates the two halves of a streaming client: the handle the registry
/// tracks and the endpoint the connection's writer task drains.
pub fn client_pair(id: ConnectionId) -> (ClientHandle, ClientEndpoint) {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let close = Arc::new(Notify::new());
    let handle = ClientHandle {
        id,
        tx,
        close: Arc::clone(&close),
        connected_at: Instant::now(),
    };
    (handle, ClientEndpoint { rx, close })
}

/// Host-side handle to a connected streaming client.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ConnectionId,
    tx: mpsc::Sender<String>,
    close: Arc<Notify>,
    connected_at: Instant,
}

impl ClientHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Never waits; a full or closed queue just loses the payload.
    fn offer(&self, payload: &str) -> bool {
        match self.tx.try_send(payload.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Client {} is not keeping up, payload dropped", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!("Client {} already gone", self.id);
                false
            }
        }
    }

    /// Close requests bypass the payload queue so a backed-up client still sees them.
    fn request_close(&self) {
        self.close.notify_one();
    }
}

/// Transport-side half of a streaming client.
#[derive(Debug)]
pub struct ClientEndpoint {
    rx: mpsc::Receiver<String>,
    close: Arc<Notify>,
}

impl ClientEndpoint {
    /// Next queued payload; `None` once the host holds no handle for this
    /// client (never tracked, or already dropped).
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Resolves when the host asked for this connection to be closed.
    pub async fn close_requested(&self) {
        self.close.notified().await
    }

    /// Non-async peek, mainly for tests.
    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// Splits the endpoint so the payload queue and the close signal can be
    /// awaited together.
    pub fn into_parts(self) -> (mpsc::Receiver<String>, Arc<Notify>) {
        (self.rx, self.close)
    }
}

/// A bounded, unordered set of clients for one channel.
#[derive(Debug)]
pub struct ClientRegistry {
    channel: Channel,
    capacity: usize,
    clients: Vec<ClientHandle>,
}

impl ClientRegistry {
    pub fn new(channel: Channel) -> Self {
        Self::with_capacity(channel, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(channel: Channel, capacity: usize) -> Self {
        Self {
            channel,
            capacity,
            clients: Vec::with_capacity(capacity),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.clients.iter().any(|c| c.id == id)
    }

    /// Starts tracking `client`. Returns `false` when the registry is full or
    /// already tracks that connection; the caller keeps the connection open
    /// but it will not receive broadcasts.
    pub fn add(&mut self, client: ClientHandle) -> bool {
        if self.clients.len() >= self.capacity || self.contains(client.id) {
            return false;
        }
        self.clients.push(client);
        true
    }

    /// Stops tracking the connection. Order of the remaining clients is not kept.
    pub fn remove(&mut self, id: ConnectionId) -> bool {
        self.take(id).is_some()
    }

    /// Like [`ClientRegistry::remove`], handing back the dropped handle.
    pub fn take(&mut self, id: ConnectionId) -> Option<ClientHandle> {
        let index = self.clients.iter().position(|c| c.id == id)?;
        Some(self.clients.swap_remove(index))
    }

    /// Queues `payload` for every tracked client and returns how many accepted it.
    pub fn broadcast(&self, payload: &str) -> usize {
        self.clients
            .iter()
            .filter(|c| c.offer(payload))
            .count()
    }

    /// Asks every tracked client to close and forgets all of them. The close
    /// events that follow find nothing to remove.
    pub fn force_close_all(&mut self) -> usize {
        let count = self.clients.len();
        for client in self.clients.drain(..) {
            client.request_close();
        }
        count
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.clients.iter().map(|c| c.id)
    }
}
