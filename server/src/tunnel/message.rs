//! Wire message codec.
//!
//! One [`Message`] travels as one binary WebSocket frame:
//!
//! ```text
//! +---------+-----------------+----------------------+---------------+
//! | version | header_len: u32 | header: JSON (UTF-8) | payload bytes |
//! | 1 byte  | 4 bytes, BE     | header_len bytes     | rest of frame |
//! +---------+-----------------+----------------------+---------------+
//! ```
//!
//! The header is `{"channel": ..., "event": ..., "id": ...}`. The payload is
//! JSON for `headers` and `error`, raw bytes for `data`, and empty for `end`,
//! so response bodies survive untouched whatever their content.
//!
//! Whole-JSON text frames (`{"channel","event","id","data"}`) are accepted on
//! decode for senders that cannot produce binary frames. Encoding always
//! produces the binary layout.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::error::TunnelError;

/// Current frame layout version.
pub const FRAME_VERSION: u8 = 1;

/// Version byte + header length.
const PREFIX_LEN: usize = 5;

/// Upper bound on the JSON header, which only carries channel/event/id.
pub const MAX_HEADER_LEN: usize = 16 * 1024;

/// Headers that describe one hop and are never replayed across the tunnel.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Lifecycle event carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Headers,
    Data,
    End,
    Error,
}

impl Event {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Headers => "headers",
            Self::Data => "data",
            Self::End => "end",
            Self::Error => "error",
        }
    }

    /// `end` and `error` close a channel.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Error)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "headers" => Ok(Self::Headers),
            "data" => Ok(Self::Data),
            "end" => Ok(Self::End),
            "error" => Ok(Self::Error),
            other => Err(TunnelError::MalformedMessage(format!(
                "unknown event tag '{other}'"
            ))),
        }
    }
}

/// A header value as it appears on the wire: a string, or an array of
/// strings when the name repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

/// HTTP header fields keyed by lowercase name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, HeaderValues>",
    into = "BTreeMap<String, HeaderValues>"
)]
pub struct HeaderFields(BTreeMap<String, HeaderValues>);

impl From<BTreeMap<String, HeaderValues>> for HeaderFields {
    fn from(raw: BTreeMap<String, HeaderValues>) -> Self {
        let mut fields = Self::new();
        for (name, values) in raw {
            match values {
                HeaderValues::One(v) => fields.append(&name, v),
                HeaderValues::Many(all) => {
                    for v in all {
                        fields.append(&name, v);
                    }
                }
            }
        }
        fields
    }
}

impl From<HeaderFields> for BTreeMap<String, HeaderValues> {
    fn from(fields: HeaderFields) -> Self {
        fields.0
    }
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, turning a single value into a list on repeat.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        let name = name.to_ascii_lowercase();
        match self.0.remove(&name) {
            None => {
                self.0.insert(name, HeaderValues::One(value));
            }
            Some(HeaderValues::One(first)) => {
                self.0.insert(name, HeaderValues::Many(vec![first, value]));
            }
            Some(HeaderValues::Many(mut all)) => {
                all.push(value);
                self.0.insert(name, HeaderValues::Many(all));
            }
        }
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        match self.0.get(&name.to_ascii_lowercase())? {
            HeaderValues::One(v) => Some(v),
            HeaderValues::Many(all) => all.first().map(String::as_str),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) {
        self.0.remove(&name.to_ascii_lowercase());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every `(name, value)` pair, repeated names yielded once per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(name, values)| {
            let values: Vec<&str> = match values {
                HeaderValues::One(v) => vec![v.as_str()],
                HeaderValues::Many(all) => all.iter().map(String::as_str).collect(),
            };
            values.into_iter().map(move |v| (name.as_str(), v))
        })
    }

    /// Drop the connection-scoped headers listed in [`HOP_BY_HOP`].
    pub fn strip_hop_by_hop(&mut self) {
        for name in HOP_BY_HOP {
            self.0.remove(*name);
        }
    }

    pub fn from_header_map(map: &HeaderMap) -> Self {
        let mut fields = Self::new();
        for (name, value) in map {
            fields.append(name.as_str(), String::from_utf8_lossy(value.as_bytes()));
        }
        fields
    }

    /// Convert to a `HeaderMap`, skipping names or values `http` rejects.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in self.iter() {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => debug!(header = name, "Skipping invalid header"),
            }
        }
        map
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderFields {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut fields = Self::new();
        for (name, value) in iter {
            fields.append(name, value);
        }
        fields
    }
}

/// Gateway → agent `headers` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHead {
    pub method: String,
    /// Resource path (and query) with the routing segment stripped.
    pub url: String,
    #[serde(default)]
    pub headers: HeaderFields,
}

impl RequestHead {
    /// Whether the request announces a body.
    pub fn has_body(&self) -> bool {
        let length = self
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0);
        length > 0 || self.headers.contains("transfer-encoding")
    }
}

/// Agent → gateway `headers` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseHead {
    pub status_code: u16,
    #[serde(default)]
    pub status_message: String,
    #[serde(default)]
    pub headers: HeaderFields,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Event-specific body of a message. The event tag is implied by the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Request(RequestHead),
    Response(ResponseHead),
    Chunk(Bytes),
    End,
    Error(ErrorDetail),
}

/// Either head shape of a `headers` event.
#[derive(Deserialize)]
#[serde(untagged)]
enum Head {
    Response(ResponseHead),
    Request(RequestHead),
}

impl From<Head> for Payload {
    fn from(head: Head) -> Self {
        match head {
            Head::Response(r) => Self::Response(r),
            Head::Request(r) => Self::Request(r),
        }
    }
}

/// One logical tunnel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    /// Request id, set on gateway → agent messages only.
    pub id: Option<String>,
    pub payload: Payload,
}

#[derive(Serialize, Deserialize)]
struct FrameHeader {
    channel: String,
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

impl Message {
    pub fn new(channel: impl Into<String>, payload: Payload) -> Self {
        Self {
            channel: channel.into(),
            id: None,
            payload,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn data(channel: impl Into<String>, chunk: impl Into<Bytes>) -> Self {
        Self::new(channel, Payload::Chunk(chunk.into()))
    }

    pub fn end(channel: impl Into<String>) -> Self {
        Self::new(channel, Payload::End)
    }

    pub fn error(channel: impl Into<String>, detail: ErrorDetail) -> Self {
        Self::new(channel, Payload::Error(detail))
    }

    pub fn event(&self) -> Event {
        match self.payload {
            Payload::Request(_) | Payload::Response(_) => Event::Headers,
            Payload::Chunk(_) => Event::Data,
            Payload::End => Event::End,
            Payload::Error(_) => Event::Error,
        }
    }

    /// Serialize into the binary frame layout.
    pub fn encode(&self) -> Bytes {
        let header = FrameHeader {
            channel: self.channel.clone(),
            event: self.event().as_str().to_string(),
            id: self.id.clone(),
        };
        let header = serde_json::to_vec(&header).expect("frame header serializes");
        let payload: Bytes = match &self.payload {
            Payload::Request(head) => serde_json::to_vec(head).expect("head serializes").into(),
            Payload::Response(head) => serde_json::to_vec(head).expect("head serializes").into(),
            Payload::Error(detail) => serde_json::to_vec(detail).expect("detail serializes").into(),
            Payload::Chunk(chunk) => chunk.clone(),
            Payload::End => Bytes::new(),
        };

        let mut frame = BytesMut::with_capacity(PREFIX_LEN + header.len() + payload.len());
        frame.put_u8(FRAME_VERSION);
        frame.put_u32(header.len() as u32);
        frame.put_slice(&header);
        frame.put_slice(&payload);
        frame.freeze()
    }

    /// Parse a binary frame.
    pub fn decode(frame: &Bytes) -> Result<Self, TunnelError> {
        if frame.len() < PREFIX_LEN {
            return Err(malformed(format!("frame too short ({} bytes)", frame.len())));
        }
        if frame[0] != FRAME_VERSION {
            return Err(malformed(format!("unsupported frame version {}", frame[0])));
        }
        let header_len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        if header_len > MAX_HEADER_LEN || PREFIX_LEN + header_len > frame.len() {
            return Err(malformed(format!("bad header length {header_len}")));
        }
        let header: FrameHeader = serde_json::from_slice(&frame[PREFIX_LEN..PREFIX_LEN + header_len])
            .map_err(|e| malformed(format!("bad frame header: {e}")))?;
        if header.channel.is_empty() {
            return Err(malformed("empty channel".to_string()));
        }
        let event: Event = header.event.parse()?;
        let body = frame.slice(PREFIX_LEN + header_len..);

        let payload = match event {
            Event::Headers => serde_json::from_slice::<Head>(&body)
                .map_err(|e| malformed(format!("bad headers payload: {e}")))?
                .into(),
            Event::Data => Payload::Chunk(body),
            Event::End => Payload::End,
            Event::Error => Payload::Error(
                serde_json::from_slice(&body)
                    .map_err(|e| malformed(format!("bad error payload: {e}")))?,
            ),
        };

        Ok(Self {
            channel: header.channel,
            id: header.id,
            payload,
        })
    }

    /// Parse a whole-JSON text frame.
    pub fn decode_text(text: &str) -> Result<Self, TunnelError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| malformed(format!("bad JSON frame: {e}")))?;
        let channel = value["channel"]
            .as_str()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| malformed("missing channel".to_string()))?
            .to_string();
        let event: Event = value["event"]
            .as_str()
            .ok_or_else(|| malformed("missing event".to_string()))?
            .parse()?;
        let id = value["id"].as_str().map(ToString::to_string);
        let data = &value["data"];

        let payload = match event {
            Event::Headers => serde_json::from_value::<Head>(data.clone())
                .map_err(|e| malformed(format!("bad headers payload: {e}")))?
                .into(),
            Event::Data => Payload::Chunk(
                coerce_bytes(data).ok_or_else(|| malformed("unusable data payload".to_string()))?,
            ),
            Event::End => Payload::End,
            Event::Error => Payload::Error(match data {
                Value::String(s) => ErrorDetail::new("ERROR", s.clone()),
                Value::Object(_) => serde_json::from_value(data.clone())
                    .unwrap_or_else(|_| ErrorDetail::new("ERROR", data.to_string())),
                other => ErrorDetail::new("ERROR", other.to_string()),
            }),
        };

        Ok(Self {
            channel,
            id,
            payload,
        })
    }
}

/// A raw socket frame as received.
#[derive(Debug, Clone)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
}

impl Frame {
    pub fn decode(&self) -> Result<Message, TunnelError> {
        match self {
            Self::Binary(bytes) => Message::decode(bytes),
            Self::Text(text) => Message::decode_text(text),
        }
    }
}

/// Recover raw bytes from a JSON-encoded body chunk.
///
/// Accepts a string (its UTF-8 bytes), an array of byte values, a
/// `{"type": "Buffer", "data": [...]}` object, or an object keyed by byte
/// index. Returns `None` if any element is not a byte.
pub fn coerce_bytes(value: &Value) -> Option<Bytes> {
    match value {
        Value::Null => Some(Bytes::new()),
        Value::String(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
            .map(Bytes::from),
        Value::Object(map) if map.get("type").and_then(Value::as_str) == Some("Buffer") => {
            coerce_bytes(map.get("data")?)
        }
        Value::Object(map) => {
            let mut indexed = map
                .iter()
                .map(|(k, v)| {
                    let idx = k.parse::<usize>().ok()?;
                    let byte = v.as_u64().and_then(|b| u8::try_from(b).ok())?;
                    Some((idx, byte))
                })
                .collect::<Option<Vec<(usize, u8)>>>()?;
            indexed.sort_unstable_by_key(|(idx, _)| *idx);
            Some(indexed.into_iter().map(|(_, b)| b).collect::<Vec<u8>>().into())
        }
        _ => None,
    }
}

fn malformed(reason: String) -> TunnelError {
    TunnelError::MalformedMessage(reason)
}
