//! Client connection handles.

use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tracing::{trace, warn};
use uuid::Uuid;

use super::protocol::Response;
use crate::observability::metrics;

/// Unique identifier for a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cloneable sending half of a client connection.
///
/// Every clone shares the closed flag: once [`close`](Self::close) is called
/// on any of them, `send` and `push` become no-ops everywhere and
/// [`closed`](Self::closed) resolves.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<Response>,
    live: bool,
    closed: Arc<watch::Sender<bool>>,
}

impl Connection {
    pub fn new(sender: mpsc::Sender<Response>, live: bool) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            sender,
            live,
            closed: Arc::new(closed),
        }
    }

    /// A connection plus the receiving end of its outbound queue.
    pub fn channel(buffer: usize, live: bool) -> (Self, mpsc::Receiver<Response>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx, live), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Live connections bind on the first successful read that does not say
    /// otherwise.
    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.sender.is_closed()
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Resolves once any clone of this connection has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Queue a reply for the client, waiting for room in the outbound queue.
    /// Returns `false` if it was dropped.
    pub async fn send(&self, response: Response) -> bool {
        if *self.closed.borrow() {
            trace!(connection_id = %self.id, "Dropping message for closed connection");
            return false;
        }
        self.sender.send(response).await.is_ok()
    }

    /// Queue a push without waiting. A full queue means the client stopped
    /// reading: the connection is closed and the message dropped.
    pub fn push(&self, response: Response) -> bool {
        if *self.closed.borrow() {
            trace!(connection_id = %self.id, "Dropping push for closed connection");
            return false;
        }
        match self.sender.try_send(response) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %self.id, "Outbound queue full, closing lagging connection");
                metrics::record_lagging_connection();
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
