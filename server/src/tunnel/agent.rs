//! Tunnel agent: outbound WS connection from the private side to the gateway.
//!
//! Maintains a persistent WebSocket to `<server_url>/ws/<key>` with
//! exponential-backoff reconnect and heartbeat pings, and hands every
//! gateway message to a [`RequestForwarder`].

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use super::channel;
use super::error::TunnelError;
use super::forwarder::{self, RequestForwarder};
use super::message::{Frame, Message};
use super::registry::{is_valid_key, OUTBOUND_QUEUE_CAPACITY};
use crate::config::AgentConfig;

/// Validate the configuration and spawn the agent task. The task runs
/// until aborted; aborting it also aborts in-flight local requests.
pub fn spawn(config: AgentConfig) -> Result<JoinHandle<()>, TunnelError> {
    let url = tunnel_url(&config.server_url, &config.key, config.tunnel_key.as_deref())?;
    forwarder::parse_forward_base(config.forward_to.as_deref())?;

    let span = info_span!("tunnel_agent", agent = %channel::routing_id(&config.key));
    Ok(tokio::spawn(agent_loop(config, url).instrument(span)))
}

/// Socket URL for an agent key, with the tunnel key as `?token=`.
pub fn tunnel_url(
    server_url: &str,
    key: &str,
    tunnel_key: Option<&str>,
) -> Result<Url, TunnelError> {
    if !is_valid_key(key) {
        return Err(TunnelError::DuplicateOrInvalid(
            "Invalid agent key".to_string(),
        ));
    }
    let invalid = |reason: String| {
        TunnelError::GatewayUnreachable(format!("invalid server url '{server_url}': {reason}"))
    };

    let mut url = Url::parse(server_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid("cannot switch scheme".to_string()))?;
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|()| invalid("cannot carry a path".to_string()))?
        .pop_if_empty()
        .push("ws")
        .push(key);
    if let Some(token) = tunnel_key {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

/// Main loop: connect, handle messages, reconnect on failure.
async fn agent_loop(config: AgentConfig, url: Url) {
    let initial_delay = Duration::from_secs(config.reconnect_delay_secs.max(1));
    let max_delay = Duration::from_secs(config.reconnect_max_delay_secs).max(initial_delay);
    let mut delay = initial_delay;

    loop {
        info!("Tunnel: connecting to gateway at {}", config.server_url);
        match connect_and_run(&config, &url).await {
            Ok(DisconnectReason::Clean) => {
                info!("Tunnel: connection closed cleanly, reconnecting...");
                delay = initial_delay;
            }
            Ok(DisconnectReason::Refused(reason)) => {
                warn!(
                    "Tunnel: gateway refused registration: {reason}, retrying in {}s",
                    delay.as_secs()
                );
            }
            Err(e) => {
                warn!(
                    "Tunnel: connection error: {e}, reconnecting in {}s",
                    delay.as_secs()
                );
            }
        }
        tokio::time::sleep(delay).await;
        delay = next_delay(delay, max_delay);
    }
}

/// Exponential backoff step, capped at `max_delay`.
fn next_delay(delay: Duration, max_delay: Duration) -> Duration {
    delay.saturating_mul(2).min(max_delay)
}

/// Reason the tunnel connection ended.
enum DisconnectReason {
    /// Normal close frame or EOF.
    Clean,
    /// Gateway closed with a policy violation (key refused).
    Refused(String),
}

/// A single connection attempt: connect, then relay until disconnect.
async fn connect_and_run(
    config: &AgentConfig,
    url: &Url,
) -> Result<DisconnectReason, Box<dyn std::error::Error + Send + Sync>> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    info!("Tunnel: connected to gateway");

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    let mut forwarder = RequestForwarder::new(
        config.forward_to.as_deref(),
        outbound_tx,
        Duration::from_millis(config.request_timeout_ms),
    )?;

    // Single writer: encodes outbound messages and sends heartbeat pings
    let heartbeat = Duration::from_secs(config.heartbeat_interval_secs.max(1));
    let writer = tokio::spawn(
        async move {
            let mut ping = tokio::time::interval(heartbeat);
            ping.tick().await;
            loop {
                let frame = tokio::select! {
                    message = outbound_rx.recv() => match message {
                        Some(message) => WsMessage::Binary(message.encode()),
                        None => break,
                    },
                    _ = ping.tick() => WsMessage::Ping(Bytes::new()),
                };
                if ws_sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_sink.close().await;
        }
        .in_current_span(),
    );

    let mut reason = DisconnectReason::Clean;
    while let Some(msg) = ws_stream.next().await {
        let frame = match msg {
            Ok(WsMessage::Binary(data)) => Frame::Binary(data),
            Ok(WsMessage::Text(text)) => Frame::Text(text.as_str().to_string()),
            Ok(WsMessage::Close(close)) => {
                if let Some(close) = close.filter(|c| c.code == CloseCode::Policy) {
                    reason = DisconnectReason::Refused(close.reason.as_str().to_string());
                }
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                forwarder.shutdown();
                writer.abort();
                return Err(e.into());
            }
        };
        match frame.decode() {
            Ok(message) => forwarder.on_message(message).await,
            Err(e) => debug!(error = %e, "Skipping undecodable frame"),
        }
    }

    forwarder.shutdown();
    writer.abort();
    Ok(reason)
}
