//! Connections, sessions, handshakes, heartbeats, replay and reconnection for tether.
//!
//! A session is the logical relationship between two peers. It outlives any
//! single connection: messages are sequenced per session, buffered until the
//! peer acknowledges them and replayed after a reconnect, so the application
//! sees every message exactly once and in order as long as the session lives.
//!
//! ## Features
//!
//! - **Connection capability**: any message-oriented link implementing [`Connection`]
//! - **Handshake**: session id and expected state exchanged on every new link
//! - **Heartbeats**: liveness detection with configurable interval and tolerance
//! - **Replay buffer**: bounded by count and bytes, with `DELIVERY_LOSS` on eviction
//! - **Reconnect**: exponential backoff with jitter and an attempt ceiling
//! - **Disconnect grace**: sessions survive link loss for a bounded period
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use std::sync::Arc;
//! use tether_session::{MemConnector, Transport, TransportEvent};
//! use tether_wire::OutgoingMessage;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (server, mut server_events) = Transport::builder("server").build()?;
//! let connector = Arc::new(MemConnector::new(server.clone()));
//! let (client, _client_events) = Transport::builder("client").connector(connector).build()?;
//!
//! client.send(&"server".into(), OutgoingMessage::new("chat", Bytes::from_static(b"hi")))?;
//!
//! while let Some(event) = server_events.recv().await {
//!     if let TransportEvent::Message { ctx, message } = event {
//!         println!("{} says {:?}", ctx.peer, message.payload);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod extensions;
pub mod handshake;
pub mod keepalive;
pub mod reliability;
pub mod replay;
mod session;
pub mod transport;

// Re-export main types
pub use config::{BackoffConfig, ReplayConfig, TransportConfig};
pub use connection::mem::{MemConnection, MemConnector};
pub use connection::{Connection, ConnectionId, Connector, LinkError, ListenerId, Subscription};
pub use error::{ErrorKind, TransportError};
pub use events::{CloseReason, SessionContext, SessionState, SessionStats, TransportEvent};
pub use extensions::Extensions;
pub use handshake::{AcceptAll, HandshakeHandler};
pub use transport::{EventReceiver, Transport, TransportBuilder};
