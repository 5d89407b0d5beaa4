//! Agent side of the tunnel: replays gateway requests against the local
//! service and streams the responses back.
//!
//! One task per channel. The request body (if the head announces one) is fed
//! to that task through a bounded pipe, so a slow local upload pauses the
//! socket reader instead of buffering without limit.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use reqwest::redirect::Policy;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

use super::channel::CHANNEL_PREFIX;
use super::error::TunnelError;
use super::message::{HeaderFields, Message, Payload, RequestHead, ResponseHead};

/// Request body chunks buffered per channel before the socket reader waits.
const BODY_PIPE_CAPACITY: usize = 16;

struct InFlight {
    task: JoinHandle<()>,
    /// Open until the gateway's `end`.
    body: Option<mpsc::Sender<Bytes>>,
}

pub struct RequestForwarder {
    base: Url,
    client: reqwest::Client,
    outbound: mpsc::Sender<Message>,
    timeout: Duration,
    in_flight: HashMap<String, InFlight>,
}

impl RequestForwarder {
    /// Forwarder for the local service at `forward_to`.
    ///
    /// The base URL must be plain or secure HTTP and carry no query string.
    pub fn new(
        forward_to: Option<&str>,
        outbound: mpsc::Sender<Message>,
        timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let base = parse_forward_base(forward_to)?;
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .connect_timeout(timeout)
            .build()
            .map_err(|e| TunnelError::InvalidForwardBase(format!("HTTP client: {e}")))?;
        Ok(Self {
            base,
            client,
            outbound,
            timeout,
            in_flight: HashMap::new(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Local-service URL for a tunneled resource path.
    ///
    /// Segments are joined onto the base path; `.` is dropped and `..` never
    /// climbs above the base path.
    pub fn target_url(&self, resource: &str) -> Url {
        let (path, query) = match resource.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (resource, None),
        };

        let mut segments: Vec<&str> = self
            .base
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let floor = segments.len();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.len() > floor {
                        segments.pop();
                    }
                }
                other => segments.push(other),
            }
        }

        let mut joined = format!("/{}", segments.join("/"));
        if path.ends_with('/') && !joined.ends_with('/') {
            joined.push('/');
        }

        let mut url = self.base.clone();
        url.set_path(&joined);
        url.set_query(query);
        url
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .values()
            .filter(|f| !f.task.is_finished())
            .count()
    }

    /// Handle one gateway message.
    pub async fn on_message(&mut self, message: Message) {
        self.in_flight.retain(|_, f| !f.task.is_finished());

        if !message.channel.starts_with(CHANNEL_PREFIX) {
            match &message.payload {
                Payload::Error(detail) => warn!(
                    channel = %message.channel,
                    code = %detail.code,
                    "Gateway reported an error: {}",
                    detail.message
                ),
                _ => debug!(channel = %message.channel, "Ignoring message outside request namespace"),
            }
            return;
        }

        let channel = message.channel;
        match message.payload {
            Payload::Request(head) => self.start(channel, head),
            Payload::Chunk(chunk) => {
                let pipe = self
                    .in_flight
                    .get(&channel)
                    .and_then(|f| f.body.clone());
                match pipe {
                    Some(pipe) => {
                        if pipe.send(chunk).await.is_err() {
                            debug!(channel = %channel, "Local request no longer reading its body");
                        }
                    }
                    None => debug!(channel = %channel, "Body chunk for unknown or bodiless request"),
                }
            }
            Payload::End => {
                if let Some(f) = self.in_flight.get_mut(&channel) {
                    f.body = None;
                }
            }
            Payload::Error(detail) => {
                if let Some(f) = self.in_flight.remove(&channel) {
                    info!(channel = %channel, code = %detail.code, "Gateway cancelled request");
                    f.task.abort();
                }
            }
            Payload::Response(_) => {
                warn!(channel = %channel, "Unexpected response head from gateway");
            }
        }
    }

    fn start(&mut self, channel: String, head: RequestHead) {
        let (body_tx, body_rx) = if head.has_body() {
            let (tx, rx) = mpsc::channel(BODY_PIPE_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let url = self.target_url(&head.url);
        let span = info_span!("forward", channel = %channel, method = %head.method);
        let task = tokio::spawn(
            fire_request(
                self.client.clone(),
                url,
                head,
                body_rx,
                self.outbound.clone(),
                channel.clone(),
                self.timeout,
            )
            .instrument(span),
        );

        if let Some(previous) = self.in_flight.insert(
            channel.clone(),
            InFlight {
                task,
                body: body_tx,
            },
        ) {
            warn!(channel = %channel, "Request head reused a live channel, aborting the old request");
            previous.task.abort();
        }
    }

    /// Abort every in-flight local request.
    pub fn shutdown(&mut self) {
        let count = self.in_flight.len();
        for (_, f) in self.in_flight.drain() {
            f.task.abort();
        }
        if count > 0 {
            info!(count, "Aborted in-flight local requests");
        }
    }
}

impl Drop for RequestForwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Validate a forward base URL.
pub fn parse_forward_base(forward_to: Option<&str>) -> Result<Url, TunnelError> {
    let raw = forward_to
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TunnelError::InvalidForwardBase("no base URL configured".to_string()))?;
    let base = Url::parse(raw).map_err(|e| TunnelError::InvalidForwardBase(format!("{raw}: {e}")))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(TunnelError::InvalidForwardBase(format!(
            "unsupported scheme '{}'",
            base.scheme()
        )));
    }
    if base.query().is_some() {
        return Err(TunnelError::InvalidForwardBase(
            "query strings are not supported".to_string(),
        ));
    }
    Ok(base)
}

/// Run one local request and report it on `channel`.
async fn fire_request(
    client: reqwest::Client,
    url: Url,
    head: RequestHead,
    body: Option<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Message>,
    channel: String,
    timeout: Duration,
) {
    debug!(url = %url, "Forwarding to local service");
    if let Err(e) = relay_response(&client, url, head, body, &outbound, &channel, timeout).await {
        warn!(error = %e, "Local request failed");
        let _ = outbound.send(Message::error(channel, e.to_detail())).await;
    }
}

async fn relay_response(
    client: &reqwest::Client,
    url: Url,
    head: RequestHead,
    body: Option<mpsc::Receiver<Bytes>>,
    outbound: &mpsc::Sender<Message>,
    channel: &str,
    timeout: Duration,
) -> Result<(), TunnelError> {
    let method = reqwest::Method::from_bytes(head.method.as_bytes())
        .map_err(|_| TunnelError::MalformedMessage(format!("bad method '{}'", head.method)))?;

    let mut headers = head.headers;
    headers.strip_hop_by_hop();
    headers.remove("host");

    let mut request = client.request(method, url).headers(headers.to_header_map());
    if let Some(rx) = body {
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, io::Error>(chunk), rx))
        });
        request = request.body(reqwest::Body::wrap_stream(stream));
    }

    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| {
            TunnelError::LocalServiceUnreachable(format!(
                "no response within {} ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| TunnelError::LocalServiceUnreachable(e.to_string()))?;

    let status = response.status();
    let status_message = response
        .extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .and_then(|r| std::str::from_utf8(r.as_bytes()).ok())
        .or_else(|| status.canonical_reason())
        .unwrap_or_default()
        .to_string();
    let mut fields = HeaderFields::from_header_map(response.headers());
    fields.strip_hop_by_hop();
    debug!(status = status.as_u16(), "Local service responded");

    send(
        outbound,
        Message::new(
            channel,
            Payload::Response(ResponseHead {
                status_code: status.as_u16(),
                status_message,
                headers: fields,
            }),
        ),
    )
    .await?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            TunnelError::LocalServiceUnreachable(format!("response body failed: {e}"))
        })?;
        if !chunk.is_empty() {
            send(outbound, Message::data(channel, chunk)).await?;
        }
    }
    send(outbound, Message::end(channel)).await
}

async fn send(outbound: &mpsc::Sender<Message>, message: Message) -> Result<(), TunnelError> {
    outbound
        .send(message)
        .await
        .map_err(|_| TunnelError::GatewayUnreachable("tunnel socket closed".to_string()))
}
