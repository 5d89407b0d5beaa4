//! Short checksums for channel and routing identifiers.
//!
//! Every exchange gets a fresh random request id; its channel is
//! `/req/<first 6 bytes of SHA-256(request id), hex>`. Agents are indexed by
//! a checksum of their key, so the raw key never appears in routing tables,
//! logs or on the tunnel wire.

use sha2::{Digest, Sha256};

use super::error::TunnelError;

/// Namespace of per-request channels. Agents ignore anything else.
pub const CHANNEL_PREFIX: &str = "/req/";

/// Channel for protocol-level notices that belong to no exchange.
pub const PROTOCOL_CHANNEL: &str = "error";

const CHANNEL_CHECKSUM_BYTES: usize = 6;
const ROUTING_CHECKSUM_BYTES: usize = 8;

/// Fresh ids tried before giving up on a free channel.
const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// First `bytes` bytes of SHA-256(`data`), lowercase hex.
pub fn checksum(data: &[u8], bytes: usize) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..bytes.min(digest.len())])
}

/// Registry key for an agent key.
pub fn routing_id(agent_key: &str) -> String {
    checksum(agent_key.as_bytes(), ROUTING_CHECKSUM_BYTES)
}

/// Channel derived from a request id.
pub fn channel_for(request_id: &str) -> String {
    format!(
        "{CHANNEL_PREFIX}{}",
        checksum(request_id.as_bytes(), CHANNEL_CHECKSUM_BYTES)
    )
}

/// A freshly allocated exchange identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub request_id: String,
    pub channel_id: String,
}

/// Allocate a channel not reported as taken by `in_use`.
///
/// A checksum collision with a live channel draws a new request id instead
/// of sharing the channel.
pub fn allocate(in_use: impl Fn(&str) -> bool) -> Result<Allocation, TunnelError> {
    allocate_with(|| uuid::Uuid::new_v4().to_string(), in_use)
}

fn allocate_with(
    mut next_id: impl FnMut() -> String,
    in_use: impl Fn(&str) -> bool,
) -> Result<Allocation, TunnelError> {
    for _ in 0..MAX_ALLOCATION_ATTEMPTS {
        let request_id = next_id();
        let channel_id = channel_for(&request_id);
        if !in_use(&channel_id) {
            return Ok(Allocation {
                request_id,
                channel_id,
            });
        }
    }
    Err(TunnelError::GatewayUnreachable(
        "no free channel id after repeated collisions".to_string(),
    ))
}

/// Hex-encode a byte slice.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().fold(
            String::with_capacity(bytes.as_ref().len() * 2),
            |mut s, b| {
                use std::fmt::Write;
                let _ = write!(s, "{b:02x}");
                s
            },
        )
    }
}
