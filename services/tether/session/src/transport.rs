//! The transport: session registry and public entry point.
//!
//! A [`Transport`] owns one session per remote peer. Outbound sessions are
//! created on demand when a [`Connector`] is configured; inbound connections
//! handed to [`Transport::handle_connection`] are held by a provisional
//! session until their handshake names a peer, at which point they either
//! start a session, resume an existing one or are rejected.

use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionId, Connector};
use crate::error::TransportError;
use crate::events::{CloseReason, SessionStats, TransportEvent};
use crate::handshake::{AcceptAll, HandshakeHandler};
use crate::session::{SessionActor, SessionCommand, SessionHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_wire::{new_message_id, BinaryCodec, Codec, HandshakeRequest, OutgoingMessage, PeerId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Receiving half of the transport event stream
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Outcome of a validated handshake against the registry
pub(crate) enum Claim {
    /// The caller now owns the peer's registry slot
    Fresh {
        /// Session the caller displaced
        replaced: Option<SessionHandle>,
    },
    /// A session with the requested id exists and should take the connection
    Resume(SessionHandle),
    /// The request wants to resume a session that does not exist here
    Mismatch(String),
}

/// State shared by the transport handle and every session actor
pub(crate) struct Shared {
    pub(crate) local_id: PeerId,
    pub(crate) config: TransportConfig,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) connector: Option<Arc<dyn Connector>>,
    pub(crate) handler: Arc<dyn HandshakeHandler>,
    pub(crate) metadata: BTreeMap<String, String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    sessions: DashMap<PeerId, SessionHandle>,
    pending: DashMap<ConnectionId, SessionHandle>,
    closed: AtomicBool,
}

impl Shared {
    /// Publish an event to the transport owner
    pub(crate) fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            debug!("Transport event receiver dropped; discarding event");
        }
    }

    /// Decide what a validated handshake from `peer` gets
    pub(crate) fn claim(
        &self,
        peer: &PeerId,
        request: &HandshakeRequest,
        claimant: SessionHandle,
    ) -> Claim {
        let claimant = SessionHandle {
            session_id: request.session_id.clone(),
            ..claimant
        };
        match self.sessions.entry(peer.clone()) {
            Entry::Occupied(entry)
                if entry.get().is_alive() && entry.get().session_id == request.session_id =>
            {
                Claim::Resume(entry.get().clone())
            }
            Entry::Occupied(mut entry) if request.is_fresh() => {
                let old = entry.insert(claimant);
                Claim::Fresh {
                    replaced: old.is_alive().then_some(old),
                }
            }
            Entry::Vacant(entry) if request.is_fresh() => {
                entry.insert(claimant);
                Claim::Fresh { replaced: None }
            }
            _ => Claim::Mismatch(format!(
                "cannot resume session {}: it is not known here",
                request.session_id
            )),
        }
    }

    /// Remove a session from the registry if it still owns its slot
    pub(crate) fn unregister(&self, peer: &PeerId, instance: u64) {
        self.sessions.remove_if(peer, |_, handle| handle.instance == instance);
    }

    /// Forget a provisional session
    pub(crate) fn unregister_pending(&self, conn: ConnectionId, instance: u64) {
        self.pending.remove_if(&conn, |_, handle| handle.instance == instance);
    }
}

/// Builder for a [`Transport`]
pub struct TransportBuilder {
    local_id: PeerId,
    config: TransportConfig,
    codec: Arc<dyn Codec>,
    connector: Option<Arc<dyn Connector>>,
    handler: Arc<dyn HandshakeHandler>,
    metadata: BTreeMap<String, String>,
}

impl TransportBuilder {
    /// Start building a transport for `local_id`
    pub fn new(local_id: impl Into<PeerId>) -> Self {
        Self {
            local_id: local_id.into(),
            config: TransportConfig::default(),
            codec: Arc::new(BinaryCodec::new()),
            connector: None,
            handler: Arc::new(AcceptAll),
            metadata: BTreeMap::new(),
        }
    }

    /// Timing and buffer configuration
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Message codec; defaults to [`BinaryCodec`]
    pub fn codec(mut self, codec: impl Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Enable outbound sessions dialed through `connector`
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Validate inbound handshakes; defaults to [`AcceptAll`]
    pub fn handshake_handler(mut self, handler: impl HandshakeHandler) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Metadata sent in outbound handshake requests
    pub fn handshake_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Validate the configuration and create the transport and its event stream
    pub fn build(self) -> Result<(Transport, EventReceiver), TransportError> {
        self.config.validate()?;
        let (events, event_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            local_id: self.local_id,
            config: self.config,
            codec: self.codec,
            connector: self.connector,
            handler: self.handler,
            metadata: self.metadata,
            events,
            sessions: DashMap::new(),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        };
        info!(
            "Transport {} ready (codec={})",
            shared.local_id,
            shared.codec.name()
        );
        Ok((
            Transport {
                shared: Arc::new(shared),
            },
            event_rx,
        ))
    }
}

/// Handle to a transport; cheap to clone
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("local_id", &self.shared.local_id)
            .field("sessions", &self.shared.sessions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport {
    /// Start building a transport
    pub fn builder(local_id: impl Into<PeerId>) -> TransportBuilder {
        TransportBuilder::new(local_id)
    }

    /// Id of this side
    pub fn local_id(&self) -> &PeerId {
        &self.shared.local_id
    }

    /// Effective configuration
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Whether [`Transport::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Peers with a live session
    pub fn peers(&self) -> Vec<PeerId> {
        self.shared
            .sessions
            .iter()
            .filter(|entry| entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Take ownership of an inbound connection. The connection must complete
    /// a handshake within the configured window or it is closed.
    pub fn handle_connection(&self, conn: Arc<dyn Connection>) -> Result<(), TransportError> {
        if self.is_closed() {
            conn.close();
            return Err(TransportError::Closed);
        }
        let conn_id = conn.id();
        let (handle, actor) = SessionActor::accept(self.shared.clone(), conn);
        self.shared.pending.insert(conn_id, handle);
        debug!("Accepted connection {} on {}", conn_id, self.shared.local_id);
        tokio::spawn(actor.run());
        Ok(())
    }

    /// Ensure an outbound session to `peer` exists and is connecting
    pub fn connect(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.session(peer).map(|_| ())
    }

    /// Queue an application message for `peer` and return its message id.
    ///
    /// The message is sequenced immediately and delivered in order once the
    /// session is connected, surviving reconnects while it fits in the replay
    /// buffer.
    pub fn send(&self, peer: &PeerId, message: OutgoingMessage) -> Result<String, TransportError> {
        let reserved = message.control_flags.reserved();
        if !reserved.is_empty() {
            return Err(TransportError::ReservedFlags(reserved));
        }
        let handle = self.session(peer)?;
        let id = new_message_id();
        handle
            .commands
            .send(SessionCommand::Send {
                id: id.clone(),
                message,
            })
            .map_err(|_| TransportError::SessionClosed(peer.clone()))?;
        Ok(id)
    }

    /// Close the session with `peer`, telling the peer not to reconnect.
    /// Returns whether a session existed.
    pub fn close_session(&self, peer: &PeerId) -> bool {
        let handle = match self.shared.sessions.get(peer) {
            Some(handle) => handle.clone(),
            None => return false,
        };
        handle
            .commands
            .send(SessionCommand::Close {
                reason: CloseReason::LocalClose,
                notify_peer: true,
            })
            .is_ok()
    }

    /// Snapshot of the session with `peer`
    pub async fn session_stats(&self, peer: &PeerId) -> Option<SessionStats> {
        let handle = self.shared.sessions.get(peer).map(|h| h.clone())?;
        let (reply, rx) = oneshot::channel();
        handle.commands.send(SessionCommand::Stats { reply }).ok()?;
        rx.await.ok()
    }

    /// Close every session and refuse further work. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing transport {}", self.shared.local_id);

        let sessions: Vec<SessionHandle> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in sessions {
            let _ = handle.commands.send(SessionCommand::Close {
                reason: CloseReason::TransportClosed,
                notify_peer: true,
            });
        }

        let pending: Vec<SessionHandle> = self
            .shared
            .pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in pending {
            let _ = handle.commands.send(SessionCommand::Close {
                reason: CloseReason::TransportClosed,
                notify_peer: false,
            });
        }
    }

    fn session(&self, peer: &PeerId) -> Result<SessionHandle, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.shared.sessions.entry(peer.clone()) {
            Entry::Occupied(entry) if entry.get().is_alive() => Ok(entry.get().clone()),
            entry => {
                let connector = match &self.shared.connector {
                    Some(connector) => connector.clone(),
                    None => {
                        warn!("No session with {} and no connector to dial it", peer);
                        return Err(TransportError::UnknownPeer(peer.clone()));
                    }
                };
                let (handle, actor) =
                    SessionActor::dial(self.shared.clone(), peer.clone(), connector);
                match entry {
                    Entry::Occupied(mut stale) => {
                        stale.insert(handle.clone());
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(handle.clone());
                    }
                }
                info!("Opening session {} to {}", handle.session_id, peer);
                tokio::spawn(actor.run());
                Ok(handle)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mem::{MemConnection, MemConnector};
    use crate::error::ErrorKind;
    use bytes::Bytes;
    use std::time::Duration;

    fn config() -> TransportConfig {
        TransportConfig {
            handshake_timeout_ms: 500,
            heartbeat_interval_ms: 100,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut cfg = config();
        cfg.heartbeat_interval_ms = 0;
        assert!(matches!(
            Transport::builder("a").config(cfg).build(),
            Err(TransportError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_connector_is_unknown_peer() {
        let (server, _events) = Transport::builder("server").config(config()).build().unwrap();
        let err = server
            .send(&"client".into(), OutgoingMessage::new("s", Bytes::new()))
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownPeer(peer) if peer.as_str() == "client"));
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_work() {
        let (server, _events) = Transport::builder("server").config(config()).build().unwrap();
        server.close();
        server.close();
        assert!(server.is_closed());

        let (a, b) = MemConnection::pair();
        assert!(matches!(server.handle_connection(b), Err(TransportError::Closed)));
        assert!(a.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_exchange() {
        let (server, mut server_events) =
            Transport::builder("server").config(config()).build().unwrap();
        let connector = Arc::new(MemConnector::new(server.clone()));
        let (client, mut client_events) = Transport::builder("client")
            .config(config())
            .connector(connector)
            .build()
            .unwrap();

        let id = client
            .send(&"server".into(), OutgoingMessage::new("s", Bytes::from_static(b"hello")))
            .unwrap();

        match client_events.recv().await.unwrap() {
            TransportEvent::SessionConnected { peer, resumed, .. } => {
                assert_eq!(peer.as_str(), "server");
                assert!(!resumed);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            server_events.recv().await.unwrap(),
            TransportEvent::SessionConnected { .. }
        ));
        match server_events.recv().await.unwrap() {
            TransportEvent::Message { ctx, message } => {
                assert_eq!(ctx.peer.as_str(), "client");
                assert_eq!(message.id, id);
                assert_eq!(message.seq, 1);
                assert_eq!(message.payload, Bytes::from_static(b"hello"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(server.peers(), vec![PeerId::from("client")]);
        let stats = client.session_stats(&"server".into()).await.unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.next_seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolvable_handshake_reports_protocol_error() {
        let (server, mut events) = Transport::builder("server").config(config()).build().unwrap();
        let (client_end, server_end) = MemConnection::pair();
        server.handle_connection(server_end).unwrap();

        assert!(client_end.send(Bytes::from_static(b"definitely not a frame")));
        match events.recv().await.unwrap() {
            TransportEvent::ProtocolError { kind, peer, .. } => {
                assert_eq!(kind, ErrorKind::MalformedHandshake);
                assert!(peer.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(client_end.is_closed());
        assert!(server.peers().is_empty());
    }
}
