//! In-memory connections.
//!
//! [`MemConnection::pair`] returns two connected ends; a frame sent on one is
//! delivered synchronously to the data listeners of the other. Closing either
//! end closes both. [`MemConnector`] dials an in-process [`Transport`].

use super::{Connection, ConnectionId, ConnectionListeners, Connector, LinkError};
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tether_wire::PeerId;
use tracing::debug;

#[derive(Debug, Default)]
struct Link {
    ends: Mutex<[Weak<MemConnection>; 2]>,
    closed: AtomicBool,
}

impl Link {
    fn end(&self, side: usize) -> Option<Arc<MemConnection>> {
        self.ends.lock().unwrap_or_else(PoisonError::into_inner)[side].upgrade()
    }

    fn shut(&self, error: Option<LinkError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for side in 0..2 {
            if let Some(end) = self.end(side) {
                if let Some(err) = &error {
                    end.listeners.error.notify(err.clone());
                }
                end.listeners.close.notify(());
            }
        }
    }
}

/// One end of an in-memory link
#[derive(Debug)]
pub struct MemConnection {
    id: ConnectionId,
    side: usize,
    link: Arc<Link>,
    listeners: ConnectionListeners,
    blackholed: AtomicBool,
    frames_sent: AtomicU64,
}

impl MemConnection {
    /// Create two connected ends
    pub fn pair() -> (Arc<MemConnection>, Arc<MemConnection>) {
        let link = Arc::new(Link::default());
        let make = |side| {
            Arc::new(MemConnection {
                id: ConnectionId::next(),
                side,
                link: link.clone(),
                listeners: ConnectionListeners::default(),
                blackholed: AtomicBool::new(false),
                frames_sent: AtomicU64::new(0),
            })
        };
        let (a, b) = (make(0), make(1));
        *link.ends.lock().unwrap_or_else(PoisonError::into_inner) =
            [Arc::downgrade(&a), Arc::downgrade(&b)];
        (a, b)
    }

    /// Fail the link: both ends see an error notification followed by close
    pub fn break_link(&self, reason: &str) {
        debug!("Breaking in-memory link at {}: {}", self.id, reason);
        self.link.shut(Some(LinkError(reason.to_string())));
    }

    /// Silently drop every frame sent from this end from now on
    pub fn blackhole(&self) {
        self.blackholed.store(true, Ordering::SeqCst);
    }

    /// Whether the link has been closed
    pub fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }

    /// Frames handed to the peer end so far
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}

impl Connection for MemConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn send(&self, frame: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.blackholed.load(Ordering::SeqCst) {
            return true;
        }
        match self.link.end(1 - self.side) {
            Some(peer) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                peer.listeners.data.notify(frame);
                true
            }
            None => false,
        }
    }

    fn close(&self) {
        self.link.shut(None);
    }

    fn listeners(&self) -> &ConnectionListeners {
        &self.listeners
    }
}

/// Connector that links a client transport to an in-process acceptor
#[derive(Debug)]
pub struct MemConnector {
    acceptor: Mutex<Transport>,
    online: AtomicBool,
    links: Mutex<Vec<Arc<MemConnection>>>,
}

impl MemConnector {
    /// Dial `acceptor` on every connect
    pub fn new(acceptor: Transport) -> Self {
        Self {
            acceptor: Mutex::new(acceptor),
            online: AtomicBool::new(true),
            links: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent dials succeed or fail
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Route subsequent dials to a different acceptor
    pub fn set_acceptor(&self, acceptor: Transport) {
        *self.acceptor.lock().unwrap_or_else(PoisonError::into_inner) = acceptor;
    }

    /// Client ends of every link created so far, oldest first
    pub fn links(&self) -> Vec<Arc<MemConnection>> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Client end of the most recent link
    pub fn last_link(&self) -> Option<Arc<MemConnection>> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl Connector for MemConnector {
    async fn connect(&self, peer: &PeerId) -> anyhow::Result<Arc<dyn Connection>> {
        if !self.online.load(Ordering::SeqCst) {
            anyhow::bail!("peer {} is unreachable", peer);
        }

        let acceptor = self
            .acceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if acceptor.local_id() != peer {
            anyhow::bail!("no in-memory listener for peer {}", peer);
        }

        let (client, server) = MemConnection::pair();
        acceptor.handle_connection(server)?;
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn record_data(conn: &MemConnection) -> Arc<Mutex<Vec<Bytes>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        conn.listeners()
            .data
            .add(move |frame| sink.lock().unwrap().push(frame));
        seen
    }

    #[test]
    fn test_pair_delivers_both_ways() {
        let (a, b) = MemConnection::pair();
        let at_a = record_data(&a);
        let at_b = record_data(&b);

        assert!(a.send(Bytes::from_static(b"ping")));
        assert!(b.send(Bytes::from_static(b"pong")));

        assert_eq!(at_b.lock().unwrap().as_slice(), &[Bytes::from_static(b"ping")]);
        assert_eq!(at_a.lock().unwrap().as_slice(), &[Bytes::from_static(b"pong")]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_close_is_idempotent_and_stops_data() {
        let (a, b) = MemConnection::pair();
        let at_b = record_data(&b);
        let closes = Arc::new(AtomicUsize::new(0));
        for end in [&a, &b] {
            let counter = closes.clone();
            end.listeners().close.add(move |()| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        a.close();
        a.close();
        b.close();

        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert!(!a.send(Bytes::from_static(b"late")));
        assert!(at_b.lock().unwrap().is_empty());
    }

    #[test]
    fn test_break_link_reports_error_then_close() {
        let (a, _b) = MemConnection::pair();
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = order.clone();
        a.listeners()
            .error
            .add(move |err: LinkError| log.lock().unwrap().push(err.0));
        let log = order.clone();
        a.listeners()
            .close
            .add(move |()| log.lock().unwrap().push("closed".to_string()));

        a.break_link("cable cut");
        a.break_link("again");

        assert_eq!(*order.lock().unwrap(), vec!["cable cut", "closed"]);
    }

    #[test]
    fn test_blackhole_swallows_frames() {
        let (a, b) = MemConnection::pair();
        let at_b = record_data(&b);
        a.blackhole();

        assert!(a.send(Bytes::from_static(b"lost")));
        assert!(at_b.lock().unwrap().is_empty());
        assert!(b.send(Bytes::from_static(b"still flows")));
    }
}
