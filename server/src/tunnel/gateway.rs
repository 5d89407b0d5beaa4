//! Gateway: accepts agent sockets and forwards inbound HTTP through them.
//!
//! Routes:
//! 1. `GET /ws/{key}` upgrades an agent connection (after the auth gate)
//! 2. `GET /api/tunnel/agents` lists connected agents
//! 3. everything else matching `<prefix>/<key>/<resource>` is tunneled to
//!    the agent registered under `key`

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message as WsMessage, WebSocket},
        Path as AxumPath, Query, Request, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn, Instrument};

use super::channel;
use super::error::TunnelError;
use super::exchange;
use super::message::{Frame, Message};
use super::registry::{is_valid_key, ClientRegistry, OUTBOUND_QUEUE_CAPACITY};
use crate::auth::{bearer_token, AllowAll, Authenticator, SharedKey, UpgradeRequest};

/// State shared across all gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: ClientRegistry,
    /// Mount point of the tunneled surface, without trailing slash.
    pub path_prefix: String,
    /// Bound on each wait for the agent during an exchange.
    pub request_timeout: Duration,
    pub auth: Arc<dyn Authenticator>,
    /// Guards the admin listing when a tunnel key is configured.
    admin: Option<SharedKey>,
}

impl GatewayState {
    /// Gateway state with the built-in gate: [`SharedKey`] when a tunnel
    /// key is set, otherwise [`AllowAll`].
    pub fn new(path_prefix: &str, request_timeout: Duration, tunnel_key: Option<String>) -> Self {
        let admin = tunnel_key.map(SharedKey::new);
        let auth: Arc<dyn Authenticator> = match &admin {
            Some(gate) => Arc::new(gate.clone()),
            None => Arc::new(AllowAll),
        };
        Self {
            registry: ClientRegistry::new(),
            path_prefix: path_prefix.trim_end_matches('/').to_string(),
            request_timeout,
            auth,
            admin,
        }
    }

    #[must_use]
    pub fn with_authenticator(mut self, auth: Arc<dyn Authenticator>) -> Self {
        self.auth = auth;
        self
    }
}

/// Build the gateway router.
pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/{key}", get(agent_register_ws))
        .route("/api/tunnel/agents", get(list_agents))
        .fallback(forward_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Split `<prefix>/<key>/<resource>` into the key and the resource path
/// (query included). `None` when the path doesn't have that shape.
pub fn parse_tunnel_path(prefix: &str, path_and_query: &str) -> Option<(String, String)> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };
    let rest = path
        .strip_prefix(prefix.trim_end_matches('/'))?
        .strip_prefix('/')?;
    let (key, resource) = rest.split_once('/')?;
    if key.is_empty() {
        return None;
    }
    let mut resource = format!("/{resource}");
    if let Some(query) = query {
        resource.push('?');
        resource.push_str(query);
    }
    Some((key.to_string(), resource))
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Not Found", "code": "NOT_FOUND"})),
    )
        .into_response()
}

/// Periodically evict agents that have been silent for longer than
/// `heartbeat_timeout`. Agents ping every heartbeat interval, so a live
/// socket is never idle for long.
pub fn spawn_heartbeat_sweep(
    registry: ClientRegistry,
    heartbeat_timeout: Duration,
) -> JoinHandle<()> {
    let period = (heartbeat_timeout / 3).max(Duration::from_millis(100));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let evicted = registry.sweep_idle(heartbeat_timeout);
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Heartbeat sweep evicted agents");
            }
        }
    })
}

// ─── Tunneled Requests ───────────────────────────────────────────────────────

async fn forward_request(State(state): State<GatewayState>, request: Request) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map_or_else(|| request.uri().path().to_string(), |pq| pq.as_str().to_string());
    let Some((key, resource)) = parse_tunnel_path(&state.path_prefix, &path_and_query) else {
        debug!(path = %request.uri().path(), "No tunnel route");
        return not_found();
    };

    let routing_id = channel::routing_id(&key);
    let Some(agent) = state.registry.lookup(&routing_id) else {
        return TunnelError::NoSuchAgent(format!("No agent connected for {routing_id}"))
            .into_response();
    };

    exchange::forward(
        &state.registry,
        agent,
        request,
        resource,
        state.request_timeout,
    )
    .await
}

// ─── Agent Registration ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RegisterQuery {
    token: Option<String>,
}

/// `GET /ws/{key}?token=<tunnel_key>`: agent WS registration.
async fn agent_register_ws(
    State(state): State<GatewayState>,
    AxumPath(key): AxumPath<String>,
    Query(query): Query<RegisterQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !is_valid_key(&key) {
        return TunnelError::DuplicateOrInvalid("Invalid agent key".to_string()).into_response();
    }

    let upgrade = UpgradeRequest {
        key,
        headers,
        token: query.token,
    };
    let admitted = match state.auth.authenticate(&upgrade).await {
        Ok(admitted) => admitted,
        Err(e @ TunnelError::AuthRejected { .. }) => {
            warn!(agent = %channel::routing_id(&upgrade.key), error = %e, "Agent rejected");
            return e.into_response();
        }
        Err(e) => {
            warn!(error = %e, "Auth gate failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Authentication failed", "code": "AUTH_FAILED"})),
            )
                .into_response();
        }
    };

    let id = channel::routing_id(&admitted.key);
    info!(agent = %id, "Agent connecting...");

    ws.on_upgrade(move |socket| {
        handle_agent_socket(socket, state, admitted.key)
            .instrument(info_span!("tunnel_agent", agent = %id))
    })
}

/// Run one agent socket until it closes or is replaced.
async fn handle_agent_socket(socket: WebSocket, state: GatewayState, key: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (agent_tx, mut agent_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);

    let agent = match state.registry.register(&key, agent_tx) {
        Ok(agent) => agent,
        Err(e) => {
            warn!(error = %e, "Agent registration refused");
            let _ = ws_sink
                .send(WsMessage::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };
    let mut shutdown_rx = agent.shutdown_signal();
    info!("Agent registered");

    // Single writer: every outbound message for this socket passes here
    let send_task = tokio::spawn(
        async move {
            while let Some(message) = agent_rx.recv().await {
                if ws_sink
                    .send(WsMessage::Binary(message.encode()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
        .in_current_span(),
    );

    loop {
        let msg = tokio::select! {
            msg = ws_stream.next() => {
                let Some(Ok(msg)) = msg else { break };
                msg
            }
            _ = shutdown_rx.changed() => {
                info!("Agent handler shutting down on request");
                break;
            }
        };
        agent.touch();
        match msg {
            WsMessage::Binary(data) => state.registry.dispatch(&Frame::Binary(data), &agent).await,
            WsMessage::Text(text) => {
                state
                    .registry
                    .dispatch(&Frame::Text(text.as_str().to_string()), &agent)
                    .await;
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }

    let failed = state.registry.on_agent_closed(&agent);
    info!(failed, "Agent disconnected");
    send_task.abort();
}

// ─── Admin ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AgentsQuery {
    token: Option<String>,
}

/// `GET /api/tunnel/agents`: list connected agents.
async fn list_agents(
    State(state): State<GatewayState>,
    Query(query): Query<AgentsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Some(admin) = &state.admin {
        let provided = query.token.as_deref().or_else(|| bearer_token(&headers));
        if !admin.accepts(provided) {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"error": "Invalid tunnel key", "code": "AUTH_REJECTED"})),
            )
                .into_response();
        }
    }

    let list: Vec<Value> = state
        .registry
        .agents()
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "state": a.state(),
                "connected_for_ms": a.connected_since().elapsed().as_millis() as u64,
                "last_seen_ago_ms": a.idle_for().as_millis() as u64,
                "open_channels": state.registry.open_channels(a),
            })
        })
        .collect();

    Json(json!({"agents": list})).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::message::{HeaderFields, Payload, RequestHead, ResponseHead};
    use crate::tunnel::registry::Agent;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use bytes::Bytes;
    use tower::ServiceExt;

    fn test_state() -> GatewayState {
        GatewayState::new("/prefix", Duration::from_secs(5), None)
    }

    fn head(status_code: u16, status_message: &str, headers: HeaderFields) -> Payload {
        Payload::Response(ResponseHead {
            status_code,
            status_message: status_message.into(),
            headers,
        })
    }

    /// Registers `key` and answers every request head with `respond(head)`.
    /// Request heads it saw are reported on the returned receiver.
    fn fake_agent<F>(
        registry: &ClientRegistry,
        key: &str,
        respond: F,
    ) -> (Arc<Agent>, mpsc::UnboundedReceiver<RequestHead>)
    where
        F: Fn(&RequestHead) -> Vec<Payload> + Send + 'static,
    {
        let (tx, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let agent = registry.register(key, tx).unwrap();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        let registry = registry.clone();
        let source = agent.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if let Payload::Request(request) = &message.payload {
                    let _ = seen_tx.send(request.clone());
                    for payload in respond(request) {
                        let reply = Message::new(message.channel.clone(), payload);
                        registry
                            .dispatch(&Frame::Binary(reply.encode()), &source)
                            .await;
                    }
                }
            }
        });
        (agent, seen_rx)
    }

    async fn body_json(response: Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn tunnel_path_parsing() {
        assert_eq!(
            parse_tunnel_path("/prefix", "/prefix/client-1/something"),
            Some(("client-1".into(), "/something".into()))
        );
        assert_eq!(
            parse_tunnel_path("/prefix/", "/prefix/client-1/a/b?x=1"),
            Some(("client-1".into(), "/a/b?x=1".into()))
        );
        assert_eq!(
            parse_tunnel_path("", "/client-1/"),
            Some(("client-1".into(), "/".into()))
        );
        assert_eq!(parse_tunnel_path("/prefix", "/prefix/client-1"), None);
        assert_eq!(parse_tunnel_path("/prefix", "/prefix//x"), None);
        assert_eq!(parse_tunnel_path("/prefix", "/other/client-1/x"), None);
        assert_eq!(parse_tunnel_path("/prefix", "/prefixed/client-1/x"), None);
    }

    #[tokio::test]
    async fn end_to_end_get_is_forwarded_with_stripped_path() {
        let state = test_state();
        let (_agent, mut seen) = fake_agent(&state.registry, "client-1", |_| {
            vec![
                head(200, "OK", HeaderFields::new()),
                Payload::Chunk(Bytes::from_static(b"hi")),
                Payload::End,
            ]
        });
        let registry = state.registry.clone();
        let app = gateway_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/prefix/client-1/something")
                    .header("x-h", "x-v")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"hi");

        let request = seen.recv().await.unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.url, "/something");
        assert_eq!(request.headers.get("x-h"), Some("x-v"));
        assert_eq!(registry.channel_count(), 0);
    }

    #[tokio::test]
    async fn error_status_and_headers_are_replayed() {
        let state = test_state();
        let (_agent, _seen) = fake_agent(&state.registry, "client-1", |_| {
            vec![
                head(404, "Not Found", [("a", "b")].into_iter().collect()),
                Payload::Chunk(Bytes::from_static(br#"{"a":"b"}"#)),
                Payload::End,
            ]
        });
        let app = gateway_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/prefix/client-1/something")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["a"], "b");
        assert_eq!(body_json(response).await, json!({"a": "b"}));
    }

    #[tokio::test]
    async fn request_body_reaches_agent_as_data_then_end() {
        let state = test_state();
        let (tx, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let agent = state.registry.register("client-1", tx).unwrap();
        let registry = state.registry.clone();
        let fake = tokio::spawn(async move {
            let opening = outbound.recv().await.unwrap();
            let mut body = Vec::new();
            loop {
                match outbound.recv().await.unwrap().payload {
                    Payload::Chunk(chunk) => body.extend_from_slice(&chunk),
                    Payload::End => break,
                    other => panic!("unexpected {other:?}"),
                }
            }
            for payload in [head(201, "Created", HeaderFields::new()), Payload::End] {
                let reply = Message::new(opening.channel.clone(), payload);
                registry.dispatch(&Frame::Binary(reply.encode()), &agent).await;
            }
            body
        });

        let response = gateway_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/prefix/client-1/upload")
                    .header("content-length", "5")
                    .body(Body::from("hello"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(fake.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn no_connected_agent_is_bad_gateway() {
        let response = gateway_router(test_state())
            .oneshot(
                Request::builder()
                    .uri("/prefix/client-1/something")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(response).await["code"], "NO_SUCH_AGENT");
    }

    #[tokio::test]
    async fn unmatched_url_is_not_found() {
        let app = gateway_router(test_state());
        for uri in ["/elsewhere/client-1/x", "/prefix/client-1", "/prefix"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn agent_closing_before_headers_is_bad_gateway() {
        let state = test_state();
        let (tx, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let agent = state.registry.register("client-1", tx).unwrap();
        let registry = state.registry.clone();
        tokio::spawn(async move {
            let _opening = outbound.recv().await;
            registry.on_agent_closed(&agent);
        });

        let registry = state.registry.clone();
        let response = gateway_router(state)
            .oneshot(
                Request::builder()
                    .uri("/prefix/client-1/x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(registry.channel_count(), 0);
    }

    #[tokio::test]
    async fn agent_closing_mid_stream_aborts_body_and_retires_channel() {
        let state = test_state();
        let (tx, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let agent = state.registry.register("client-1", tx).unwrap();
        let registry = state.registry.clone();
        tokio::spawn(async move {
            let opening = outbound.recv().await.unwrap();
            for payload in [
                head(200, "OK", HeaderFields::new()),
                Payload::Chunk(Bytes::from_static(b"partial")),
            ] {
                let reply = Message::new(opening.channel.clone(), payload);
                registry.dispatch(&Frame::Binary(reply.encode()), &agent).await;
            }
            registry.on_agent_closed(&agent);
        });

        let registry = state.registry.clone();
        let response = gateway_router(state)
            .oneshot(
                Request::builder()
                    .uri("/prefix/client-1/x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
        assert_eq!(registry.channel_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_exchanges_stay_isolated() {
        let state = test_state();
        let (_agent, _seen) = fake_agent(&state.registry, "client-1", |request| {
            vec![
                head(200, "OK", HeaderFields::new()),
                Payload::Chunk(Bytes::from(request.url.clone())),
                Payload::End,
            ]
        });
        let app = gateway_router(state);

        let calls = (0..8).map(|i| {
            let app = app.clone();
            async move {
                let response = app
                    .oneshot(
                        Request::builder()
                            .uri(format!("/prefix/client-1/item/{i}"))
                            .body(Body::empty())
                            .unwrap(),
                    )
                    .await
                    .unwrap();
                let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
                (i, body)
            }
        });
        for (i, body) in futures::future::join_all(calls).await {
            assert_eq!(body, format!("/item/{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn admin_listing_requires_token_when_configured() {
        let state = GatewayState::new("/", Duration::from_secs(5), Some("s3cret".into()));
        let (_agent, _seen) = fake_agent(&state.registry, "client-1", |_| Vec::new());
        let app = gateway_router(state);

        let denied = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/tunnel/agents")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let listed = app
            .oneshot(
                Request::builder()
                    .uri("/api/tunnel/agents?token=s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
        let json = body_json(listed).await;
        let agents = json["agents"].as_array().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0]["id"], channel::routing_id("client-1"));
        assert_eq!(agents[0]["state"], "connected");
        assert!(agents[0]["connected_for_ms"].is_u64());
        assert!(agents[0]["last_seen_ago_ms"].is_u64());
    }

    #[tokio::test]
    async fn silent_agent_is_evicted_by_heartbeat_sweep() {
        let state = test_state();
        let (agent, _seen) = fake_agent(&state.registry, "client-1", |_| Vec::new());
        let mut shutdown = agent.shutdown_signal();
        let sweep = spawn_heartbeat_sweep(state.registry.clone(), Duration::from_millis(150));
        let app = gateway_router(state.clone());

        tokio::time::timeout(Duration::from_secs(3), shutdown.changed())
            .await
            .unwrap()
            .unwrap();
        sweep.abort();
        assert!(state.registry.lookup(&agent.id).is_none());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/prefix/client-1/something")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
