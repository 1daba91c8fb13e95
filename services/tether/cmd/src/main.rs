//! In-process tether demo.
//!
//! Starts a server and a client transport joined by in-memory connections,
//! streams messages from the client, optionally breaks the link part way and
//! reports what the server received once the session has settled.

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tether::{
    BinaryCodec, JsonCodec, MemConnector, OutgoingMessage, PeerId, Transport, TransportConfig,
    TransportEvent,
};
use tokio::time::{timeout, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod logging;

use logging::TetherLogFormatter;

/// Reconnect-tolerant session demo over in-memory connections
#[derive(Parser, Debug)]
#[command(name = "tether-demo", version, about)]
struct Args {
    /// Configuration file path; missing files fall back to defaults
    #[arg(long, default_value = "tether.yaml")]
    config: PathBuf,

    /// Number of messages the client sends
    #[arg(long, default_value_t = 10)]
    messages: u64,

    /// Break the link after this many messages have been sent
    #[arg(long)]
    break_after: Option<u64>,

    /// Message codec: binary or json
    #[arg(long, default_value = "binary")]
    codec: String,

    /// How long to wait for every message to arrive, e.g. 5s
    #[arg(long, default_value = "5s")]
    wait: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_transport(
    id: &str,
    codec: &str,
    config: &TransportConfig,
) -> anyhow::Result<tether::TransportBuilder> {
    let builder = Transport::builder(id).config(config.clone());
    Ok(match codec {
        "binary" => builder.codec(BinaryCodec::new()),
        "json" => builder.codec(JsonCodec),
        other => bail!("unknown codec '{}'", other),
    })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("tether={}", args.log_level).parse()?)
        .add_directive(format!("tether_session={}", args.log_level).parse()?)
        .add_directive(format!("tether_wire={}", args.log_level).parse()?)
        .add_directive(format!("tether_demo={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(TetherLogFormatter::new())
        .init();

    info!("Starting tether demo v{}", env!("CARGO_PKG_VERSION"));

    let config = TransportConfig::load_from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let (server, mut server_events) = build_transport("server", &args.codec, &config)?.build()?;
    let connector = Arc::new(MemConnector::new(server.clone()));
    let (client, mut client_events) = build_transport("client", &args.codec, &config)?
        .connector(connector.clone())
        .build()?;

    tokio::spawn(async move {
        while let Some(event) = client_events.recv().await {
            match event {
                TransportEvent::SessionConnected { resumed, .. } => {
                    info!("Client connected (resumed={})", resumed)
                }
                TransportEvent::SessionLost { kind, .. } => warn!("Client lost its link: {}", kind),
                TransportEvent::DeliveryLoss { seq, .. } => warn!("Client lost seq {}", seq),
                TransportEvent::SessionClosed { reason, .. } => {
                    warn!("Client session closed: {}", reason)
                }
                _ => {}
            }
        }
    });

    let server_peer = PeerId::from("server");
    for n in 1..=args.messages {
        let payload = Bytes::from(format!("message {}", n));
        client.send(&server_peer, OutgoingMessage::new("demo", payload))?;
        if args.break_after == Some(n) {
            match connector.last_link() {
                Some(link) => {
                    info!("Breaking the link after {} messages", n);
                    link.break_link("demo break");
                }
                None => warn!("No link to break after {} messages", n),
            }
        }
        tokio::task::yield_now().await;
    }

    let deadline = Instant::now() + *args.wait;
    let mut received = Vec::new();
    while (received.len() as u64) < args.messages {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = match timeout(remaining, server_events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                warn!("Timed out waiting for messages");
                break;
            }
        };
        match event {
            TransportEvent::Message { message, .. } => {
                info!(
                    "Server received seq {}: {}",
                    message.seq,
                    String::from_utf8_lossy(&message.payload)
                );
                received.push(message.seq);
            }
            TransportEvent::ProtocolError { kind, detail, .. } => {
                warn!("Server protocol error {}: {}", kind, detail)
            }
            _ => {}
        }
    }

    if let Some(stats) = client.session_stats(&server_peer).await {
        info!(
            "Client session {}: sent={} replayed={} resumptions={} links_lost={}",
            stats.session_id,
            stats.messages_sent,
            stats.messages_replayed,
            stats.resumptions,
            stats.links_lost
        );
    }
    info!(
        "Server received {}/{} messages in order: {}",
        received.len(),
        args.messages,
        received.windows(2).all(|w| w[0] + 1 == w[1])
    );

    client.close();
    server.close();
    Ok(())
}
