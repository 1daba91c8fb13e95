//! Per-peer session actor.
//!
//! Each session runs as its own task and owns everything about one logical
//! peer relationship: the sequencing state, the replay buffer, the current
//! link (if any) and the timers of its current state. It reacts to commands
//! from the [`crate::Transport`], to events forwarded by its connection and to
//! a single deadline derived from its state:
//!
//! | state               | deadline                                  |
//! |---------------------|-------------------------------------------|
//! | NoConnection        | reconnect attempt (dialer), grace expiry  |
//! | WaitingForHandshake | handshake timeout                         |
//! | Handshaking         | handshake timeout                         |
//! | Connected           | next heartbeat, liveness expiry           |
//!
//! Leaving a state drops its timers with it, and every transition to
//! `NoConnection` or `Closed` deregisters and closes the current link.

use crate::backoff::ReconnectState;
use crate::connection::{Connection, ConnectionEvent, ConnectionId, Connector, Subscription};
use crate::error::ErrorKind;
use crate::events::{CloseReason, SessionContext, SessionState, SessionStats, TransportEvent};
use crate::extensions::Extensions;
use crate::handshake::{self, Rejection};
use crate::keepalive::{build_heartbeat, Liveness};
use crate::reliability::{Receive, RecvState, SendState, SequenceError};
use crate::transport::{Claim, Shared};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_wire::{
    ControlFlags, HandshakeRequest, HandshakeResponse, OutgoingMessage, PeerId, RejectCode,
    TransportMessage,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

/// Stream id of session-level control messages
const SESSION_STREAM_ID: &str = "session";

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

type DialFuture = BoxFuture<'static, anyhow::Result<Arc<dyn Connection>>>;

/// Commands the transport sends to a session
pub(crate) enum SessionCommand {
    /// Sequence and send an application message
    Send {
        id: String,
        message: OutgoingMessage,
    },
    /// Take over an inbound connection whose handshake names this session
    Adopt {
        conn: Arc<dyn Connection>,
        request: HandshakeRequest,
        extensions: Extensions,
    },
    /// End the session
    Close {
        reason: CloseReason,
        notify_peer: bool,
    },
    /// Report counters
    Stats { reply: oneshot::Sender<SessionStats> },
}

/// Registry entry of a running session
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub(crate) instance: u64,
    pub(crate) session_id: String,
    pub(crate) commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    /// Whether the session task is still accepting commands
    pub(crate) fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Dials and sends handshake requests
    Dialer,
    /// Accepts connections and answers handshakes
    Acceptor,
}

enum Phase {
    NoConnection { retry_at: Option<Instant> },
    WaitingForHandshake { deadline: Instant },
    Handshaking { deadline: Instant },
    Connected { liveness: Liveness },
    Closed,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::NoConnection { .. } => SessionState::NoConnection,
            Phase::WaitingForHandshake { .. } => SessionState::WaitingForHandshake,
            Phase::Handshaking { .. } => SessionState::Handshaking,
            Phase::Connected { .. } => SessionState::Connected,
            Phase::Closed => SessionState::Closed,
        }
    }
}

/// What the state deadline asks for
enum Due {
    GraceExpired,
    Dial,
    HandshakeTimeout,
    LivenessTimeout,
    Heartbeat,
    Nothing,
}

pub(crate) struct SessionActor {
    shared: Arc<Shared>,
    role: Role,
    instance: u64,
    /// Unknown until an accepted connection completes its handshake
    peer: Option<PeerId>,
    session_id: String,
    /// Registry key while this is a provisional acceptor session
    accepted_on: Option<ConnectionId>,
    connector: Option<Arc<dyn Connector>>,
    phase: Phase,
    /// Present exactly in WaitingForHandshake, Handshaking and Connected
    link: Option<Subscription>,
    dial: Option<DialFuture>,
    send: SendState,
    recv: RecvState,
    reconnect: ReconnectState,
    disconnected_since: Option<Instant>,
    ever_connected: bool,
    extensions: Arc<Extensions>,
    stats: SessionStats,
    commands_tx: mpsc::UnboundedSender<SessionCommand>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    inbox_tx: mpsc::UnboundedSender<ConnectionEvent>,
    inbox: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl SessionActor {
    fn new(shared: Arc<Shared>, role: Role, peer: Option<PeerId>, session_id: String) -> Self {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let send = SendState::new(shared.config.replay.clone());
        let reconnect = ReconnectState::new(shared.config.backoff.clone());
        Self {
            shared,
            role,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            peer,
            session_id,
            accepted_on: None,
            connector: None,
            phase: Phase::NoConnection { retry_at: None },
            link: None,
            dial: None,
            send,
            recv: RecvState::default(),
            reconnect,
            disconnected_since: None,
            ever_connected: false,
            extensions: Arc::new(Extensions::new()),
            stats: SessionStats::default(),
            commands_tx,
            commands,
            inbox_tx,
            inbox,
        }
    }

    /// A new outbound session to `peer`; the first dial happens right away
    pub(crate) fn dial(
        shared: Arc<Shared>,
        peer: PeerId,
        connector: Arc<dyn Connector>,
    ) -> (SessionHandle, Self) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut actor = Self::new(shared, Role::Dialer, Some(peer), session_id);
        let now = Instant::now();
        actor.connector = Some(connector);
        actor.disconnected_since = Some(now);
        actor.phase = Phase::NoConnection {
            retry_at: actor.reconnect.next_attempt().map(|delay| now + delay),
        };
        (actor.handle(), actor)
    }

    /// A provisional session holding an inbound connection until its handshake
    pub(crate) fn accept(shared: Arc<Shared>, conn: Arc<dyn Connection>) -> (SessionHandle, Self) {
        let mut actor = Self::new(shared, Role::Acceptor, None, String::new());
        actor.accepted_on = Some(conn.id());
        actor.link = Some(Subscription::subscribe(conn, actor.inbox_tx.clone()));
        actor.phase = Phase::WaitingForHandshake {
            deadline: Instant::now() + actor.shared.config.handshake_timeout(),
        };
        (actor.handle(), actor)
    }

    fn handle(&self) -> SessionHandle {
        SessionHandle {
            instance: self.instance,
            session_id: self.session_id.clone(),
            commands: self.commands_tx.clone(),
        }
    }

    fn peer_name(&self) -> &str {
        self.peer.as_ref().map_or("<unidentified>", PeerId::as_str)
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.link.as_ref().map(Subscription::id)
    }

    /// Run until the session is closed
    pub(crate) async fn run(mut self) {
        while !matches!(self.phase, Phase::Closed) {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;

                Some(event) = self.inbox.recv() => {
                    self.handle_connection_event(event);
                }

                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                }

                _ = sleep_until_opt(deadline) => {
                    self.handle_timer();
                }

                result = poll_dial(&mut self.dial) => {
                    self.dial = None;
                    self.handle_dial(result);
                }
            }
        }
        self.drain();
    }

    fn transition(&mut self, next: Phase) {
        let from = self.phase.state();
        let to = next.state();
        if !from.can_transition_to(to) {
            error!(
                "Illegal transition {:?} -> {:?} for session {} with {}",
                from,
                to,
                self.session_id,
                self.peer_name()
            );
        }
        debug!(
            "Session {} with {}: {:?} -> {:?}",
            self.session_id,
            self.peer_name(),
            from,
            to
        );
        if matches!(to, SessionState::NoConnection | SessionState::Closed) {
            if let Some(link) = self.link.take() {
                link.close();
            }
        }
        self.phase = next;
    }

    fn grace_deadline(&self) -> Option<Instant> {
        self.disconnected_since
            .map(|since| since + self.shared.config.disconnect_grace())
    }

    fn next_deadline(&self) -> Option<Instant> {
        match &self.phase {
            Phase::NoConnection { retry_at } => {
                [*retry_at, self.grace_deadline()].into_iter().flatten().min()
            }
            Phase::WaitingForHandshake { deadline } | Phase::Handshaking { deadline } => {
                Some(*deadline)
            }
            Phase::Connected { liveness } => Some(liveness.next_wakeup()),
            Phase::Closed => None,
        }
    }

    fn due(&self, now: Instant) -> Due {
        match &self.phase {
            Phase::NoConnection { retry_at } => {
                if self.grace_deadline().map_or(false, |grace| now >= grace) {
                    Due::GraceExpired
                } else if retry_at.map_or(false, |at| now >= at) {
                    Due::Dial
                } else {
                    Due::Nothing
                }
            }
            Phase::WaitingForHandshake { deadline } | Phase::Handshaking { deadline } => {
                if now >= *deadline {
                    Due::HandshakeTimeout
                } else {
                    Due::Nothing
                }
            }
            Phase::Connected { liveness } => {
                if liveness.is_dead(now) {
                    Due::LivenessTimeout
                } else if liveness.heartbeat_due(now) {
                    Due::Heartbeat
                } else {
                    Due::Nothing
                }
            }
            Phase::Closed => Due::Nothing,
        }
    }

    fn handle_timer(&mut self) {
        let now = Instant::now();
        match self.due(now) {
            Due::GraceExpired => {
                info!(
                    "No reconnect from {} within {:?}; closing session {}",
                    self.peer_name(),
                    self.shared.config.disconnect_grace(),
                    self.session_id
                );
                self.close(CloseReason::GraceExpired, false);
            }
            Due::Dial => self.start_dial(),
            Due::HandshakeTimeout => {
                let detail = format!(
                    "no handshake within {:?}",
                    self.shared.config.handshake_timeout()
                );
                self.handshake_failed(ErrorKind::HandshakeTimeout, detail);
            }
            Due::LivenessTimeout => {
                warn!(
                    "No traffic from {} for {:?}",
                    self.peer_name(),
                    self.shared.config.liveness_timeout()
                );
                self.lose_connection(ErrorKind::LivenessTimeout);
            }
            Due::Heartbeat => self.send_heartbeat(now),
            Due::Nothing => {}
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Send { id, message } => self.send_message(id, message),
            SessionCommand::Adopt {
                conn,
                request,
                extensions,
            } => self.adopt(conn, request, extensions),
            SessionCommand::Close {
                reason,
                notify_peer,
            } => self.close(reason, notify_peer),
            SessionCommand::Stats { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        if self.connection_id() != Some(event.connection_id()) {
            trace!(
                "Ignoring event from stale connection {}",
                event.connection_id()
            );
            return;
        }
        match event {
            ConnectionEvent::Data(_, frame) => self.handle_frame(frame),
            ConnectionEvent::Error(id, err) => {
                warn!("Connection {} to {} failed: {}", id, self.peer_name(), err);
                self.link_down(ErrorKind::ConnectionError, err.to_string());
            }
            ConnectionEvent::Closed(id) => {
                debug!("Connection {} to {} closed", id, self.peer_name());
                self.link_down(ErrorKind::ConnectionClosed, format!("{} closed", id));
            }
        }
    }

    fn link_down(&mut self, kind: ErrorKind, detail: String) {
        match self.phase.state() {
            SessionState::Connected => self.lose_connection(kind),
            SessionState::WaitingForHandshake | SessionState::Handshaking => {
                self.handshake_failed(kind, detail)
            }
            SessionState::NoConnection | SessionState::Closed => {}
        }
    }

    fn handle_frame(&mut self, frame: Bytes) {
        let now = Instant::now();
        self.stats.last_frame_at = Some(now);

        let msg = match self.shared.codec.from_bytes(&frame) {
            Ok(msg) => msg,
            Err(e) => {
                if self.phase.state() == SessionState::Connected {
                    warn!(
                        "Undecodable frame from {} ({}); dropping the connection",
                        self.peer_name(),
                        e
                    );
                    self.lose_connection(ErrorKind::ConnectionError);
                } else {
                    self.handshake_failed(ErrorKind::MalformedHandshake, e.to_string());
                }
                return;
            }
        };

        match self.phase.state() {
            SessionState::WaitingForHandshake => self.on_handshake_request(msg),
            SessionState::Handshaking => self.on_handshake_response(msg),
            SessionState::Connected => self.on_message(msg, now),
            SessionState::NoConnection | SessionState::Closed => {}
        }
    }

    /// Encode and send on the current link; `false` if nothing was sent
    fn send_frame(&self, msg: &TransportMessage) -> bool {
        let Some(link) = &self.link else {
            return false;
        };
        match self.shared.codec.to_bytes(msg) {
            Ok(frame) => link.connection().send(frame),
            Err(e) => {
                error!(
                    "Failed to encode {:?} message for {}: {}",
                    msg.control_flags,
                    self.peer_name(),
                    e
                );
                false
            }
        }
    }

    fn start_dial(&mut self) {
        if let Phase::NoConnection { retry_at } = &mut self.phase {
            *retry_at = None;
        }
        let (Some(connector), Some(peer)) = (self.connector.clone(), self.peer.clone()) else {
            return;
        };
        debug!(
            "Dialing {} for session {} (attempt {})",
            peer,
            self.session_id,
            self.reconnect.attempts()
        );
        self.dial = Some(Box::pin(async move { connector.connect(&peer).await }));
    }

    fn handle_dial(&mut self, result: anyhow::Result<Arc<dyn Connection>>) {
        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to connect to {}: {}", self.peer_name(), e);
                self.schedule_reconnect();
                return;
            }
        };
        let Some(peer) = self.peer.clone() else {
            conn.close();
            return;
        };
        if !matches!(self.phase, Phase::NoConnection { .. }) {
            conn.close();
            return;
        }

        self.link = Some(Subscription::subscribe(conn, self.inbox_tx.clone()));
        let deadline = Instant::now() + self.shared.config.handshake_timeout();
        self.transition(Phase::Handshaking { deadline });

        let request = handshake::build_request(
            &self.session_id,
            &self.send,
            &self.recv,
            &self.shared.metadata,
        );
        let sent = match request.into_message(self.shared.local_id.clone(), peer.clone()) {
            Ok(msg) => self.send_frame(&msg),
            Err(e) => {
                error!("Failed to build handshake request for {}: {}", peer, e);
                false
            }
        };
        if sent {
            debug!(
                "Sent handshake for session {} to {} (last_received={}, next_unacked={})",
                self.session_id,
                peer,
                request.expected_session_state.last_received,
                request.expected_session_state.next_unacked_seq
            );
        } else {
            self.handshake_failed(
                ErrorKind::ConnectionError,
                "could not send handshake request".to_string(),
            );
        }
    }

    fn schedule_reconnect(&mut self) {
        match self.reconnect.next_attempt() {
            Some(delay) => {
                debug!("Reconnecting to {} in {:?}", self.peer_name(), delay);
                if let Phase::NoConnection { retry_at } = &mut self.phase {
                    *retry_at = Some(Instant::now() + delay);
                }
            }
            None => {
                warn!(
                    "Giving up on {} after {} attempts",
                    self.peer_name(),
                    self.reconnect.attempts()
                );
                self.close(CloseReason::ReconnectExhausted, false);
            }
        }
    }

    fn handshake_failed(&mut self, kind: ErrorKind, detail: String) {
        let connection = self.connection_id();
        warn!(
            "Handshake with {} on {:?} failed ({}): {}",
            self.peer_name(),
            connection,
            kind,
            detail
        );
        self.shared.emit(TransportEvent::ProtocolError {
            peer: self.peer.clone(),
            connection,
            kind,
            detail,
        });
        match self.role {
            Role::Dialer => {
                self.transition(Phase::NoConnection { retry_at: None });
                self.schedule_reconnect();
            }
            Role::Acceptor => self.close(CloseReason::HandshakeRejected, false),
        }
    }

    fn send_rejection(&self, peer: &PeerId, rejection: Rejection, kind: ErrorKind) {
        warn!(
            "Rejecting handshake from {} ({:?}): {}",
            peer, rejection.code, rejection.reason
        );
        let response = HandshakeResponse::Rejected {
            code: rejection.code,
            reason: rejection.reason.clone(),
        };
        match response.into_message(self.shared.local_id.clone(), peer.clone()) {
            Ok(msg) => {
                self.send_frame(&msg);
            }
            Err(e) => error!("Failed to build handshake rejection for {}: {}", peer, e),
        }
        self.shared.emit(TransportEvent::ProtocolError {
            peer: Some(peer.clone()),
            connection: self.connection_id(),
            kind,
            detail: rejection.reason,
        });
    }

    /// First message on a provisional acceptor session
    fn on_handshake_request(&mut self, msg: TransportMessage) {
        let peer = msg.from.clone();
        let (request, extensions) = match handshake::accept_request(
            &self.shared.local_id,
            &msg,
            self.shared.handler.as_ref(),
        ) {
            Ok(accepted) => accepted,
            Err(rejection) => {
                let kind = ErrorKind::from(rejection.code);
                self.send_rejection(&peer, rejection, kind);
                self.close(CloseReason::HandshakeRejected, false);
                return;
            }
        };

        match self.shared.claim(&peer, &request, self.handle()) {
            Claim::Resume(existing) => self.hand_over(existing, request, extensions),
            Claim::Fresh { replaced } => {
                if let Some(old) = replaced {
                    info!(
                        "Peer {} started session {}, replacing session {}",
                        peer, request.session_id, old.session_id
                    );
                    let _ = old.commands.send(SessionCommand::Close {
                        reason: CloseReason::Replaced,
                        notify_peer: false,
                    });
                }
                if let Some(conn) = self.accepted_on.take() {
                    self.shared.unregister_pending(conn, self.instance);
                }
                self.peer = Some(peer);
                self.session_id = request.session_id;
                self.extensions = Arc::new(extensions);
                self.skip_evicted(request.expected_session_state.next_unacked_seq);
                self.accept_handshake(0, false);
            }
            Claim::Mismatch(reason) => {
                let rejection = Rejection {
                    code: RejectCode::SessionStateMismatch,
                    reason,
                };
                self.send_rejection(&peer, rejection, ErrorKind::SessionStateMismatch);
                self.close(CloseReason::StateMismatch, false);
            }
        }
    }

    /// Pass the connection to the session it resumes and end this provisional one
    fn hand_over(
        &mut self,
        existing: SessionHandle,
        request: HandshakeRequest,
        extensions: Extensions,
    ) {
        let Some(conn) = self.link.take().map(Subscription::release) else {
            return;
        };
        self.transition(Phase::Closed);
        if let Some(id) = self.accepted_on.take() {
            self.shared.unregister_pending(id, self.instance);
        }
        debug!(
            "Handing connection {} to session {}",
            conn.id(),
            existing.session_id
        );
        let adopt = SessionCommand::Adopt {
            conn,
            request,
            extensions,
        };
        if let Err(mpsc::error::SendError(SessionCommand::Adopt { conn, .. })) =
            existing.commands.send(adopt)
        {
            conn.close();
        }
    }

    /// An existing acceptor session takes over a connection that asks to resume it
    fn adopt(
        &mut self,
        conn: Arc<dyn Connection>,
        request: HandshakeRequest,
        extensions: Extensions,
    ) {
        let Some(peer) = self.peer.clone() else {
            conn.close();
            return;
        };
        match self.phase.state() {
            SessionState::Closed => {
                conn.close();
                return;
            }
            SessionState::Connected => {
                info!(
                    "Peer {} reconnected on {} while connected; dropping the old connection",
                    peer,
                    conn.id()
                );
                self.lose_connection(ErrorKind::ConnectionClosed);
            }
            _ => {}
        }

        self.link = Some(Subscription::subscribe(conn, self.inbox_tx.clone()));
        let deadline = Instant::now() + self.shared.config.handshake_timeout();
        self.transition(Phase::WaitingForHandshake { deadline });

        if let Err(rejection) =
            handshake::check_resume(&request.expected_session_state, &self.send, &self.recv)
        {
            self.send_rejection(&peer, rejection, ErrorKind::SessionStateMismatch);
            self.close(CloseReason::StateMismatch, false);
            return;
        }
        self.extensions = Arc::new(extensions);
        self.skip_evicted(request.expected_session_state.next_unacked_seq);
        self.accept_handshake(request.expected_session_state.last_received, true);
    }

    fn accept_handshake(&mut self, remote_last_received: u64, resumed: bool) {
        if let Some(peer) = self.peer.clone() {
            let response = HandshakeResponse::Accepted {
                session_id: self.session_id.clone(),
                last_received: self.recv.last_received(),
                next_unacked_seq: self.send.next_unacked_seq(),
            };
            match response.into_message(self.shared.local_id.clone(), peer.clone()) {
                Ok(msg) => {
                    self.send_frame(&msg);
                }
                Err(e) => error!("Failed to build handshake response for {}: {}", peer, e),
            }
        }
        self.establish(remote_last_received, resumed);
    }

    /// Handshake response on a dialer session
    fn on_handshake_response(&mut self, msg: TransportMessage) {
        if self.peer.as_ref() != Some(&msg.from) {
            let detail = format!("handshake response from unexpected peer {}", msg.from);
            self.handshake_failed(ErrorKind::MalformedHandshake, detail);
            return;
        }
        let response = match HandshakeResponse::from_message(&msg) {
            Ok(response) => response,
            Err(e) => {
                self.handshake_failed(ErrorKind::MalformedHandshake, e.to_string());
                return;
            }
        };

        match response {
            HandshakeResponse::Accepted {
                session_id,
                last_received,
                next_unacked_seq,
            } => {
                if session_id != self.session_id {
                    self.state_mismatch(format!(
                        "peer accepted session {} but this is session {}",
                        session_id, self.session_id
                    ));
                    return;
                }
                if let Err(reason) = self.send.can_resume_from(last_received) {
                    self.state_mismatch(reason);
                    return;
                }
                self.skip_evicted(next_unacked_seq);
                let resumed = self.ever_connected;
                self.establish(last_received, resumed);
            }
            HandshakeResponse::Rejected { code, reason } => {
                warn!(
                    "Peer {} rejected session {} ({:?}): {}",
                    self.peer_name(),
                    self.session_id,
                    code,
                    reason
                );
                self.shared.emit(TransportEvent::ProtocolError {
                    peer: self.peer.clone(),
                    connection: self.connection_id(),
                    kind: ErrorKind::from(code),
                    detail: reason,
                });
                let close_reason = match code {
                    RejectCode::SessionStateMismatch => CloseReason::StateMismatch,
                    _ => CloseReason::HandshakeRejected,
                };
                self.close(close_reason, false);
            }
        }
    }

    /// Continue past seqs the peer evicted before they reached this side
    fn skip_evicted(&mut self, peer_next_unacked: u64) {
        let skipped = self.recv.skip_to(peer_next_unacked);
        if skipped > 0 {
            warn!(
                "Peer {} evicted {} messages before delivery; session {} continues at seq {}",
                self.peer_name(),
                skipped,
                self.session_id,
                peer_next_unacked
            );
            self.stats.messages_skipped += skipped;
        }
    }

    fn state_mismatch(&mut self, detail: String) {
        warn!(
            "Session {} with {} cannot be resumed: {}",
            self.session_id,
            self.peer_name(),
            detail
        );
        self.shared.emit(TransportEvent::ProtocolError {
            peer: self.peer.clone(),
            connection: self.connection_id(),
            kind: ErrorKind::SessionStateMismatch,
            detail,
        });
        // the acceptor already considers the session connected
        self.close(CloseReason::StateMismatch, true);
    }

    /// Enter Connected and replay whatever the peer has not seen
    fn establish(&mut self, remote_last_received: u64, resumed: bool) {
        if let Err(e) = self.send.process_ack(remote_last_received) {
            self.violation(e);
            return;
        }
        let liveness = Liveness::new(&self.shared.config, Instant::now());
        self.transition(Phase::Connected { liveness });
        self.reconnect.reset();
        self.disconnected_since = None;
        self.ever_connected = true;
        if resumed {
            self.stats.resumptions += 1;
        }

        let pending = self
            .send
            .replay_after(remote_last_received, self.recv.last_received());
        if let Some(first) = pending.first() {
            info!(
                "Replaying {} messages to {} starting at seq {}",
                pending.len(),
                self.peer_name(),
                first.seq
            );
        }
        for msg in &pending {
            if !self.send_frame(msg) {
                break;
            }
            self.stats.messages_replayed += 1;
        }

        info!(
            "Session {} with {} connected on {:?} (resumed={})",
            self.session_id,
            self.peer_name(),
            self.connection_id(),
            resumed
        );
        if let Some(peer) = self.peer.clone() {
            self.shared.emit(TransportEvent::SessionConnected {
                peer,
                session_id: self.session_id.clone(),
                resumed,
            });
        }
    }

    /// Steady-state receive path
    fn on_message(&mut self, msg: TransportMessage, now: Instant) {
        if let Phase::Connected { liveness } = &mut self.phase {
            liveness.record_inbound(now);
        }
        if msg.to != self.shared.local_id || self.peer.as_ref() != Some(&msg.from) {
            warn!(
                "Dropping message {} addressed {} -> {} on session with {}",
                msg.id,
                msg.from,
                msg.to,
                self.peer_name()
            );
            return;
        }
        if let Err(e) = self.send.process_ack(msg.ack) {
            self.violation(e);
            return;
        }

        if msg.is_session_close() {
            info!("Peer {} closed session {}", self.peer_name(), self.session_id);
            self.close(CloseReason::PeerClose, false);
            return;
        }
        if msg.is_heartbeat() {
            trace!("Heartbeat from {} (ack={})", self.peer_name(), msg.ack);
            return;
        }
        if msg.is_handshake() {
            warn!(
                "Ignoring handshake from {} on connected session {}",
                self.peer_name(),
                self.session_id
            );
            return;
        }

        match self.recv.classify(msg.seq) {
            Ok(Receive::Deliver) => {
                self.recv.advance();
                self.stats.messages_delivered += 1;
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                self.shared.emit(TransportEvent::Message {
                    ctx: SessionContext {
                        peer,
                        session_id: self.session_id.clone(),
                        extensions: self.extensions.clone(),
                    },
                    message: msg,
                });
            }
            Ok(Receive::Duplicate) => {
                debug!(
                    "Dropping duplicate seq {} from {} (last received {})",
                    msg.seq,
                    self.peer_name(),
                    self.recv.last_received()
                );
                self.stats.duplicates_dropped += 1;
            }
            Err(e) => self.violation(e),
        }
    }

    fn violation(&mut self, err: SequenceError) {
        error!(
            "Protocol violation by {} on session {}: {}",
            self.peer_name(),
            self.session_id,
            err
        );
        self.shared.emit(TransportEvent::ProtocolError {
            peer: self.peer.clone(),
            connection: self.connection_id(),
            kind: ErrorKind::ProtocolViolation,
            detail: err.to_string(),
        });
        self.close(CloseReason::ProtocolViolation, true);
    }

    fn send_message(&mut self, id: String, message: OutgoingMessage) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let msg = self.send.stamp(
            message,
            id,
            self.shared.local_id.clone(),
            peer.clone(),
            self.recv.last_received(),
        );
        let frame = match self.shared.codec.to_bytes(&msg) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode message {} for {}: {}", msg.id, peer, e);
                self.shared.emit(TransportEvent::SendFailed {
                    peer,
                    message_id: msg.id,
                    detail: e.to_string(),
                });
                return;
            }
        };

        trace!("Sending seq {} to {}", msg.seq, peer);
        let evicted = self.send.commit(msg);
        self.stats.messages_sent += 1;
        if let (Phase::Connected { .. }, Some(link)) = (&self.phase, &self.link) {
            link.connection().send(frame);
        }
        for lost in evicted {
            self.report_loss(lost);
        }
    }

    fn report_loss(&mut self, lost: TransportMessage) {
        self.stats.messages_evicted += 1;
        self.stats.degraded = true;
        warn!(
            "Replay buffer for {} overflowed: seq {} (message {}) will not be delivered",
            self.peer_name(),
            lost.seq,
            lost.id
        );
        if let Some(peer) = self.peer.clone() {
            self.emit_loss(&peer, lost);
        }
    }

    fn emit_loss(&self, peer: &PeerId, lost: TransportMessage) {
        self.shared.emit(TransportEvent::DeliveryLoss {
            peer: peer.clone(),
            session_id: self.session_id.clone(),
            seq: lost.seq,
            message_id: lost.id,
        });
    }

    fn send_heartbeat(&mut self, now: Instant) {
        if let Phase::Connected { liveness } = &mut self.phase {
            liveness.record_heartbeat(now);
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };
        let ack = self.recv.last_received();
        let heartbeat = build_heartbeat(self.shared.local_id.clone(), peer, ack);
        if self.send_frame(&heartbeat) {
            self.stats.heartbeats_sent += 1;
            trace!("Sent heartbeat to {} (ack={})", self.peer_name(), heartbeat.ack);
        }
    }

    /// Connected -> NoConnection
    fn lose_connection(&mut self, kind: ErrorKind) {
        warn!(
            "Lost connection to {} ({}); session {} awaiting reconnect",
            self.peer_name(),
            kind,
            self.session_id
        );
        self.stats.links_lost += 1;
        self.disconnected_since = Some(Instant::now());
        self.transition(Phase::NoConnection { retry_at: None });
        if let Some(peer) = self.peer.clone() {
            self.shared.emit(TransportEvent::SessionLost {
                peer,
                session_id: self.session_id.clone(),
                kind,
            });
        }
        if self.role == Role::Dialer {
            self.schedule_reconnect();
        }
    }

    /// Terminal; idempotent
    fn close(&mut self, reason: CloseReason, notify_peer: bool) {
        if matches!(self.phase, Phase::Closed) {
            return;
        }
        let state = self.phase.state();
        if notify_peer && matches!(state, SessionState::Connected | SessionState::Handshaking) {
            if let Some(peer) = self.peer.clone() {
                let bye = TransportMessage::control(
                    self.shared.local_id.clone(),
                    peer,
                    SESSION_STREAM_ID,
                    ControlFlags::SESSION_CLOSE,
                    self.recv.last_received(),
                    Bytes::new(),
                );
                self.send_frame(&bye);
            }
        }

        self.transition(Phase::Closed);
        self.dial = None;
        let abandoned = self.send.abandon();
        if let Some(conn) = self.accepted_on.take() {
            self.shared.unregister_pending(conn, self.instance);
        }

        match self.peer.clone() {
            Some(peer) => {
                self.shared.unregister(&peer, self.instance);
                info!(
                    "Session {} with {} closed: {} ({} unacknowledged messages dropped)",
                    self.session_id,
                    peer,
                    reason,
                    abandoned.len()
                );
                for lost in abandoned {
                    self.emit_loss(&peer, lost);
                }
                self.shared.emit(TransportEvent::SessionClosed {
                    peer,
                    session_id: self.session_id.clone(),
                    reason,
                });
            }
            None => debug!("Discarded unidentified connection: {}", reason),
        }
    }

    /// Settle commands that raced with closing
    fn drain(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::Adopt { conn, .. } => conn.close(),
                SessionCommand::Send { id, .. } => {
                    warn!(
                        "Dropping message {} sent after session {} closed",
                        id, self.session_id
                    );
                    if let Some(peer) = self.peer.clone() {
                        self.shared.emit(TransportEvent::SendFailed {
                            peer,
                            message_id: id,
                            detail: format!("session {} closed", self.session_id),
                        });
                    }
                }
                SessionCommand::Close { .. } | SessionCommand::Stats { .. } => {}
            }
        }
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            state: self.phase.state(),
            session_id: self.session_id.clone(),
            next_seq: self.send.next_seq(),
            last_acked: self.send.cum_acked(),
            last_received: self.recv.last_received(),
            buffered: self.send.buffered(),
            buffered_bytes: self.send.buffered_bytes(),
            ..self.stats.clone()
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn poll_dial(dial: &mut Option<DialFuture>) -> anyhow::Result<Arc<dyn Connection>> {
    match dial {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}
