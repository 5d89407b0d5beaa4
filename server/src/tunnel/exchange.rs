//! Gateway side of one tunneled HTTP exchange.
//!
//! The request head goes out on a fresh channel, the request body is pumped
//! behind it, and the agent's `headers`/`data`/`end`/`error` events are
//! replayed as the HTTP response. Every wait on the agent is bounded by the
//! request timeout.
//!
//! ```text
//!   HeadersPending --headers--> Streaming --end/error--> Closed
//!         |                         |
//!         +--error/timeout----------+--timeout/client gone--> Closed
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    response::IntoResponse,
};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info_span, warn, Instrument};

use super::error::TunnelError;
use super::message::{ErrorDetail, HeaderFields, Message, Payload, RequestHead, ResponseHead};
use super::registry::{Agent, ClientRegistry, OpenChannel, Retirement, INBOX_CAPACITY};

/// Error code the gateway sends when it abandons an exchange.
pub const CANCELLED: &str = "CANCELLED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    HeadersPending,
    Streaming,
    Closed,
}

/// What an accepted agent event means for the HTTP response.
#[derive(Debug)]
pub enum Step {
    Head(ResponseHead),
    Chunk(Bytes),
    Finished,
    Failed(TunnelError),
}

/// Event-order state machine for one channel.
#[derive(Debug)]
pub struct ForwardedExchange {
    channel_id: String,
    state: ExchangeState,
}

impl ForwardedExchange {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            state: ExchangeState::HeadersPending,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Apply one agent message. An out-of-order event closes the exchange.
    pub fn on_message(&mut self, message: Message) -> Result<Step, TunnelError> {
        let event = message.event();
        match (self.state, message.payload) {
            (ExchangeState::HeadersPending, Payload::Response(head)) => self.on_headers(head),
            (ExchangeState::Streaming, Payload::Chunk(chunk)) => Ok(Step::Chunk(chunk)),
            (ExchangeState::Streaming, Payload::End) => Ok(self.on_end()),
            (ExchangeState::HeadersPending | ExchangeState::Streaming, Payload::Error(detail)) => {
                Ok(self.on_error(detail))
            }
            (state, _) => {
                self.state = ExchangeState::Closed;
                Err(TunnelError::ProtocolViolation(format!(
                    "unexpected '{event}' event on {} while {state:?}",
                    self.channel_id
                )))
            }
        }
    }

    fn on_headers(&mut self, head: ResponseHead) -> Result<Step, TunnelError> {
        if StatusCode::from_u16(head.status_code).is_err() {
            self.state = ExchangeState::Closed;
            return Err(TunnelError::ProtocolViolation(format!(
                "invalid status code {}",
                head.status_code
            )));
        }
        self.state = ExchangeState::Streaming;
        Ok(Step::Head(head))
    }

    fn on_end(&mut self) -> Step {
        self.state = ExchangeState::Closed;
        Step::Finished
    }

    fn on_error(&mut self, detail: ErrorDetail) -> Step {
        self.state = ExchangeState::Closed;
        Step::Failed(TunnelError::Remote(detail))
    }
}

/// Forward `request` to `agent` as `resource` and build the response.
///
/// Failures before the agent's `headers` event become an error response;
/// failures after it abort the response body mid-stream.
pub async fn forward(
    registry: &ClientRegistry,
    agent: Arc<Agent>,
    request: Request<Body>,
    resource: String,
    timeout: Duration,
) -> Response<Body> {
    let OpenChannel {
        allocation,
        inbox,
        retirement,
    } = match registry.open_channel(&agent) {
        Ok(open) => open,
        Err(e) => return e.into_response(),
    };
    let span = info_span!("exchange", channel = %allocation.channel_id);

    let driver = Driver {
        agent,
        exchange: ForwardedExchange::new(allocation.channel_id.clone()),
        inbox,
        _retirement: retirement,
        timeout,
        pump: None,
        settled: false,
    };
    driver
        .run(request, resource, allocation.request_id)
        .instrument(span)
        .await
}

/// Stop signal for the request body pump. `Some(reason)` also tells the
/// agent the exchange is cancelled.
type PumpStop = oneshot::Sender<Option<String>>;

struct Driver {
    agent: Arc<Agent>,
    exchange: ForwardedExchange,
    inbox: mpsc::Receiver<Message>,
    /// Dropped with the driver, which removes the channel-table entry.
    _retirement: Retirement,
    timeout: Duration,
    pump: Option<PumpStop>,
    /// Set once the exchange has ended or been cancelled.
    settled: bool,
}

impl Driver {
    async fn run(
        mut self,
        request: Request<Body>,
        resource: String,
        request_id: String,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let head = RequestHead {
            method: parts.method.as_str().to_string(),
            url: resource,
            headers: HeaderFields::from_header_map(&parts.headers),
        };
        debug!(method = %head.method, url = %head.url, "Forwarding request");

        let opening = Message::new(self.exchange.channel_id(), Payload::Request(head))
            .with_id(request_id);
        if let Err(e) = self.agent.send_within(opening, self.timeout).await {
            warn!(error = %e, "Could not queue request for agent");
            self.finish();
            return e.into_response();
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        self.pump = Some(stop_tx);
        tokio::spawn(
            pump_request_body(
                self.agent.clone(),
                self.exchange.channel_id().to_string(),
                body,
                self.timeout,
                stop_rx,
            )
            .in_current_span(),
        );

        let head = match self.await_headers().await {
            Ok(head) => head,
            Err(e) => {
                self.finish();
                return e.into_response();
            }
        };

        let (body_tx, body_rx) = mpsc::channel::<Result<Bytes, io::Error>>(INBOX_CAPACITY);
        let response = match build_response(head, body_rx) {
            Ok(response) => response,
            Err(e) => {
                self.cancel("invalid response head");
                return e.into_response();
            }
        };
        tokio::spawn(self.stream_body(body_tx).in_current_span());
        response
    }

    async fn await_headers(&mut self) -> Result<ResponseHead, TunnelError> {
        let message = match tokio::time::timeout(self.timeout, self.inbox.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return Err(TunnelError::GatewayUnreachable(
                    "Agent disconnected before responding".to_string(),
                ))
            }
            Err(_) => {
                warn!("Agent did not send response headers before the deadline");
                self.cancel("deadline exceeded");
                return Err(self.timeout_error());
            }
        };
        match self.exchange.on_message(message) {
            Ok(Step::Head(head)) => Ok(head),
            Ok(Step::Failed(e)) => Err(e),
            Ok(other) => {
                self.cancel("protocol violation");
                Err(TunnelError::ProtocolViolation(format!(
                    "{other:?} before headers"
                )))
            }
            Err(e) => {
                warn!(error = %e, "Closing exchange");
                self.cancel("protocol violation");
                Err(e)
            }
        }
    }

    /// Replay `data` events into the response body until the channel ends.
    async fn stream_body(mut self, body_tx: mpsc::Sender<Result<Bytes, io::Error>>) {
        loop {
            let next = tokio::select! {
                next = self.inbox.recv() => next,
                () = tokio::time::sleep(self.timeout) => {
                    warn!("Agent stalled mid-response, aborting");
                    self.cancel("deadline exceeded");
                    abort_body(&body_tx, "deadline exceeded").await;
                    break;
                }
                () = body_tx.closed() => {
                    debug!("Client went away mid-response");
                    self.cancel("client closed connection");
                    break;
                }
            };
            let Some(message) = next else {
                abort_body(&body_tx, "agent disconnected").await;
                break;
            };
            match self.exchange.on_message(message) {
                Ok(Step::Chunk(chunk)) => {
                    match tokio::time::timeout(self.timeout, body_tx.send(Ok(chunk))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {
                            debug!("Client went away mid-response");
                            self.cancel("client closed connection");
                            break;
                        }
                        Err(_) => {
                            self.cancel("deadline exceeded");
                            break;
                        }
                    }
                }
                Ok(Step::Finished) => break,
                Ok(Step::Failed(e)) => {
                    warn!(error = %e, "Agent failed the exchange mid-response");
                    abort_body(&body_tx, &e.to_string()).await;
                    break;
                }
                Ok(Step::Head(_)) => {
                    self.cancel("protocol violation");
                    abort_body(&body_tx, "duplicate response head").await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Closing exchange");
                    self.cancel("protocol violation");
                    abort_body(&body_tx, &e.to_string()).await;
                    break;
                }
            }
        }
        self.finish();
    }

    /// Tell the agent to stop working on this channel.
    ///
    /// While the body pump runs it is the only writer on the channel, so it
    /// sends the notice after its last chunk.
    fn cancel(&mut self, reason: &str) {
        self.settled = true;
        if let Some(stop) = self.pump.take() {
            match stop.send(Some(reason.to_string())) {
                Ok(()) => return,
                Err(_) => debug!("Request body pump already done"),
            }
        }
        notify_cancelled(&self.agent, self.exchange.channel_id(), reason);
    }

    fn timeout_error(&self) -> TunnelError {
        TunnelError::Timeout(self.timeout.as_millis() as u64)
    }

    /// End the exchange without notifying the agent.
    fn finish(&mut self) {
        self.settled = true;
        if let Some(stop) = self.pump.take() {
            let _ = stop.send(None);
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Client went away before the response");
            self.cancel("client closed connection");
        }
    }
}

fn notify_cancelled(agent: &Agent, channel: &str, reason: &str) {
    let notice = Message::error(channel, ErrorDetail::new(CANCELLED, reason));
    if !agent.try_send(notice) {
        debug!("Could not queue cancellation notice");
    }
}

/// Send the request body as `data` events followed by `end`, until told
/// to stop. A stop with a reason is followed by the cancellation notice.
async fn pump_request_body(
    agent: Arc<Agent>,
    channel: String,
    body: Body,
    timeout: Duration,
    mut stop: oneshot::Receiver<Option<String>>,
) {
    let pumped = tokio::select! {
        pumped = send_request_body(&agent, &channel, body, timeout) => pumped,
        stopped = &mut stop => {
            if let Ok(Some(reason)) = stopped {
                notify_cancelled(&agent, &channel, &reason);
            }
            return;
        }
    };
    if let Err(e) = pumped {
        debug!(error = %e, "Request body not delivered");
    }
    // A stop that raced the last send is still honoured.
    stop.close();
    if let Ok(Some(reason)) = stop.try_recv() {
        notify_cancelled(&agent, &channel, &reason);
    }
}

async fn send_request_body(
    agent: &Agent,
    channel: &str,
    body: Body,
    timeout: Duration,
) -> Result<(), TunnelError> {
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let message = match chunk {
            Ok(chunk) if chunk.is_empty() => continue,
            Ok(chunk) => Message::data(channel, chunk),
            Err(e) => {
                debug!(error = %e, "Request body failed");
                let failure =
                    Message::error(channel, ErrorDetail::new("REQUEST_BODY", e.to_string()));
                return agent.send_within(failure, timeout).await;
            }
        };
        agent.send_within(message, timeout).await?;
    }
    agent.send_within(Message::end(channel), timeout).await
}

fn build_response(
    head: ResponseHead,
    body_rx: mpsc::Receiver<Result<Bytes, io::Error>>,
) -> Result<Response<Body>, TunnelError> {
    let status = StatusCode::from_u16(head.status_code).map_err(|_| {
        TunnelError::ProtocolViolation(format!("invalid status code {}", head.status_code))
    })?;

    let mut fields = head.headers;
    fields.strip_hop_by_hop();

    let stream = futures::stream::unfold(body_rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    *response.headers_mut() = fields.to_header_map();

    if !head.status_message.is_empty()
        && status.canonical_reason() != Some(head.status_message.as_str())
    {
        match hyper::ext::ReasonPhrase::try_from(head.status_message.into_bytes()) {
            Ok(reason) => {
                response.extensions_mut().insert(reason);
            }
            Err(_) => debug!("Ignoring unusable status message"),
        }
    }
    Ok(response)
}

async fn abort_body(body_tx: &mpsc::Sender<Result<Bytes, io::Error>>, reason: &str) {
    let _ = body_tx.send(Err(io::Error::other(reason.to_string()))).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::message::{Event, Frame};
    use crate::tunnel::registry::OUTBOUND_QUEUE_CAPACITY;

    fn response_head(status_code: u16) -> Message {
        Message::new(
            "/req/aa",
            Payload::Response(ResponseHead {
                status_code,
                status_message: String::new(),
                headers: HeaderFields::new(),
            }),
        )
    }

    #[test]
    fn happy_path_walks_the_states() {
        let mut ex = ForwardedExchange::new("/req/aa");
        assert_eq!(ex.state(), ExchangeState::HeadersPending);
        assert!(matches!(ex.on_message(response_head(200)), Ok(Step::Head(_))));
        assert_eq!(ex.state(), ExchangeState::Streaming);
        assert!(matches!(
            ex.on_message(Message::data("/req/aa", "hi")),
            Ok(Step::Chunk(_))
        ));
        assert!(matches!(
            ex.on_message(Message::end("/req/aa")),
            Ok(Step::Finished)
        ));
        assert_eq!(ex.state(), ExchangeState::Closed);
    }

    #[test]
    fn data_before_headers_is_a_violation() {
        let mut ex = ForwardedExchange::new("/req/aa");
        let err = ex.on_message(Message::data("/req/aa", "x")).unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolViolation(_)));
        assert_eq!(ex.state(), ExchangeState::Closed);
    }

    #[test]
    fn second_head_and_late_events_are_violations() {
        let mut ex = ForwardedExchange::new("/req/aa");
        ex.on_message(response_head(200)).unwrap();
        assert!(ex.on_message(response_head(200)).is_err());
        assert!(ex.on_message(Message::end("/req/aa")).is_err());
    }

    #[test]
    fn invalid_status_code_is_a_violation() {
        let mut ex = ForwardedExchange::new("/req/aa");
        assert!(matches!(
            ex.on_message(response_head(42)),
            Err(TunnelError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn error_event_fails_with_remote_detail() {
        let mut ex = ForwardedExchange::new("/req/aa");
        let step = ex
            .on_message(Message::error(
                "/req/aa",
                ErrorDetail::new("ECONNREFUSED", "refused"),
            ))
            .unwrap();
        match step {
            Step::Failed(TunnelError::Remote(detail)) => assert_eq!(detail.code, "ECONNREFUSED"),
            other => panic!("expected remote failure, got {other:?}"),
        }
    }

    #[test]
    fn custom_reason_phrase_is_kept() {
        let (_tx, rx) = mpsc::channel(1);
        let head = ResponseHead {
            status_code: 200,
            status_message: "Fine Thanks".into(),
            headers: [("x-a", "b"), ("connection", "close")].into_iter().collect(),
        };
        let response = build_response(head, rx).unwrap();
        let reason = response.extensions().get::<hyper::ext::ReasonPhrase>().unwrap();
        assert_eq!(reason.as_bytes(), b"Fine Thanks");
        assert_eq!(response.headers()["x-a"], "b");
        assert!(response.headers().get("connection").is_none());
    }

    #[tokio::test]
    async fn silent_agent_times_out_and_gets_cancelled() {
        let registry = ClientRegistry::new();
        let (tx, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let agent = registry.register("client-1", tx).unwrap();

        let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = forward(
            &registry,
            agent,
            request,
            "/x".into(),
            Duration::from_millis(50),
        )
        .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(registry.channel_count(), 0);

        let mut saw_cancel = false;
        while let Ok(message) = outbound.try_recv() {
            if let Payload::Error(detail) = message.payload {
                saw_cancel = detail.code == CANCELLED;
            }
        }
        assert!(saw_cancel);
    }

    #[tokio::test]
    async fn agent_error_before_headers_is_bad_gateway() {
        let registry = ClientRegistry::new();
        let (tx, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let agent = registry.register("client-1", tx).unwrap();

        let fake = {
            let registry = registry.clone();
            let agent = agent.clone();
            tokio::spawn(async move {
                let opening = outbound.recv().await.unwrap();
                let reply = Message::error(
                    opening.channel,
                    ErrorDetail::new("ECONNREFUSED", "connect ECONNREFUSED"),
                );
                registry.dispatch(&Frame::Binary(reply.encode()), &agent).await;
            })
        };

        let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = forward(&registry, agent, request, "/x".into(), Duration::from_secs(5)).await;
        fake.await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "ECONNREFUSED");
    }

    #[tokio::test]
    async fn stalled_agent_queue_times_out() {
        let registry = ClientRegistry::new();
        let (tx, _outbound) = mpsc::channel(1);
        tx.try_send(Message::end("/req/zz")).unwrap();
        let agent = registry.register("client-1", tx).unwrap();

        let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
        let response = tokio::time::timeout(
            Duration::from_secs(3),
            forward(&registry, agent, request, "/x".into(), Duration::from_millis(50)),
        )
        .await
        .expect("forward must honour its deadline");
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(registry.channel_count(), 0);
    }

    #[tokio::test]
    async fn nothing_follows_the_cancellation_notice() {
        let registry = ClientRegistry::new();
        let (tx, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let agent = registry.register("client-1", tx).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let collector = {
            let seen = seen.clone();
            tokio::spawn(async move {
                while let Some(message) = outbound.recv().await {
                    seen.lock().unwrap().push(message);
                }
            })
        };

        // A request body that keeps trickling in until the exchange gives up.
        let trickle = futures::stream::unfold((), |()| async {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Some((Ok::<_, io::Error>(Bytes::from_static(b"x")), ()))
        });
        let request = Request::builder()
            .method("POST")
            .uri("/upload")
            .body(Body::from_stream(trickle))
            .unwrap();
        let response = forward(
            &registry,
            agent,
            request,
            "/upload".into(),
            Duration::from_millis(100),
        )
        .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        tokio::time::sleep(Duration::from_millis(100)).await;
        collector.abort();
        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|m| m.event() == Event::Data));
        match &seen.last().unwrap().payload {
            Payload::Error(detail) => assert_eq!(detail.code, CANCELLED),
            other => panic!("expected cancellation last, got {other:?}"),
        }
        let notices = seen
            .iter()
            .filter(|m| matches!(m.payload, Payload::Error(_)))
            .count();
        assert_eq!(notices, 1);
    }

    #[tokio::test]
    async fn caller_leaving_before_headers_cancels_the_agent() {
        let registry = ClientRegistry::new();
        let (tx, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let agent = registry.register("client-1", tx).unwrap();

        let exchange = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let request = Request::builder().uri("/x").body(Body::empty()).unwrap();
                forward(&registry, agent, request, "/x".into(), Duration::from_secs(30)).await
            })
        };
        let opening = outbound.recv().await.unwrap();
        assert_eq!(opening.event(), Event::Headers);

        exchange.abort();
        assert!(exchange.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut cancelled = false;
        while let Ok(message) = outbound.try_recv() {
            assert_eq!(message.channel, opening.channel);
            if let Payload::Error(detail) = message.payload {
                cancelled = detail.code == CANCELLED;
            }
        }
        assert!(cancelled);
        assert_eq!(registry.channel_count(), 0);
    }
}
