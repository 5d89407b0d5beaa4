//! HTTP-over-WebSocket tunnel.
//!
//! Two roles share one wire protocol:
//!
//! - **Gateway** ([`gateway`]): accepts agent sockets and inbound HTTP,
//!   runs one [`exchange`] per request over the matching agent's socket.
//! - **Agent** ([`agent`]): keeps a socket open to the gateway and replays
//!   each request against a local service via the [`forwarder`].
//!
//! Every exchange owns a channel (`/req/<checksum>`) on the socket; messages
//! of different channels interleave freely, messages of one channel never
//! reorder (`headers`, `data`*, then `end` or `error`).

pub mod agent;
pub mod channel;
pub mod error;
pub mod exchange;
pub mod forwarder;
pub mod gateway;
pub mod message;
pub mod registry;
