//! Abstract connection capability.
//!
//! A [`Connection`] wraps one physical link. It can send a frame, be closed,
//! and notifies registered listeners about inbound data, link errors and
//! closure. It knows nothing about sessions.
//!
//! Listener sets are copy-on-notify: a notification runs against a snapshot of
//! the registered callbacks, so adding or removing listeners from inside a
//! callback is safe.

pub mod mem;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tether_wire::PeerId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Process-unique identifier of one physical link
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate the next id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Link-level failure reported by a connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("link error: {0}")]
pub struct LinkError(pub String);

/// Handle returned on registration, used for removal
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct ListenerId(u64);

type Callback<A> = Arc<dyn Fn(A) + Send + Sync>;

/// Ordered set of callbacks for one notification kind
pub struct ListenerSet<A> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(ListenerId, Callback<A>)>>,
}

impl<A: Clone> ListenerSet<A> {
    /// Create an empty set
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Callback<A>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback
    pub fn add(&self, callback: impl Fn(A) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback; returns whether it was registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no callback is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback registered at the time of the call
    pub fn notify(&self, arg: A) {
        let snapshot: Vec<Callback<A>> = self.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in snapshot {
            callback(arg.clone());
        }
    }
}

impl<A: Clone> Default for ListenerSet<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for ListenerSet<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("ListenerSet").field("len", &len).finish()
    }
}

/// The three listener sets every connection exposes
#[derive(Debug, Default)]
pub struct ConnectionListeners {
    /// Inbound frames
    pub data: ListenerSet<Bytes>,
    /// Link failures; always followed by a close notification
    pub error: ListenerSet<LinkError>,
    /// Link closed; fires exactly once
    pub close: ListenerSet<()>,
}

/// One physical bidirectional link
pub trait Connection: Send + Sync + fmt::Debug + 'static {
    /// Identifier for logs and stale-event filtering
    fn id(&self) -> ConnectionId;

    /// Send one frame. Returns `false` when the link is not open; the frame
    /// was not sent, which is not an error.
    fn send(&self, frame: Bytes) -> bool;

    /// Close the link. Idempotent; the close notification fires exactly once.
    fn close(&self);

    /// Listener registry of this link
    fn listeners(&self) -> &ConnectionListeners;
}

/// Notification forwarded from a connection to its owning session
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A frame arrived
    Data(ConnectionId, Bytes),
    /// The link failed
    Error(ConnectionId, LinkError),
    /// The link closed
    Closed(ConnectionId),
}

impl ConnectionEvent {
    /// Connection the event came from
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Data(id, _)
            | ConnectionEvent::Error(id, _)
            | ConnectionEvent::Closed(id) => *id,
        }
    }
}

/// Listeners installed on a connection on behalf of a session.
///
/// All three callbacks forward into the session's inbox. Dropping the
/// subscription deregisters them, so every state exit cleans up no matter
/// which path it takes.
#[derive(Debug)]
pub struct Subscription {
    conn: Arc<dyn Connection>,
    data: ListenerId,
    error: ListenerId,
    close: ListenerId,
}

impl Subscription {
    /// Register forwarding listeners on `conn`
    pub fn subscribe(
        conn: Arc<dyn Connection>,
        sink: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let id = conn.id();
        let listeners = conn.listeners();

        let data_sink = sink.clone();
        let data = listeners.data.add(move |frame| {
            let _ = data_sink.send(ConnectionEvent::Data(id, frame));
        });
        let error_sink = sink.clone();
        let error = listeners.error.add(move |err| {
            let _ = error_sink.send(ConnectionEvent::Error(id, err));
        });
        let close = listeners.close.add(move |()| {
            let _ = sink.send(ConnectionEvent::Closed(id));
        });

        Self {
            conn,
            data,
            error,
            close,
        }
    }

    /// Id of the subscribed connection
    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// The subscribed connection
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Deregister the listeners and hand the connection back, still open
    pub fn release(self) -> Arc<dyn Connection> {
        let conn = Arc::clone(&self.conn);
        drop(self);
        conn
    }

    /// Deregister the listeners and close the connection
    pub fn close(self) {
        self.release().close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let listeners = self.conn.listeners();
        listeners.data.remove(self.data);
        listeners.error.remove(self.error);
        listeners.close.remove(self.close);
    }
}

/// Client-side capability to open a new link to a peer
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dial `peer`; the returned connection is open and has no listeners
    async fn connect(&self, peer: &PeerId) -> anyhow::Result<Arc<dyn Connection>>;
}
