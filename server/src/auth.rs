//! Agent admission.
//!
//! Every tunnel socket upgrade passes through one [`Authenticator`] call
//! before the agent is admitted into the registry. The token travels as a
//! `?token=` query parameter or an `Authorization: Bearer` header (agents
//! behind restrictive proxies can't always set headers on upgrades).

use axum::http::{HeaderMap, StatusCode};
use futures::future::BoxFuture;

use crate::tunnel::error::TunnelError;

/// What the gate sees of a connection attempt.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Agent key from the upgrade path.
    pub key: String,
    pub headers: HeaderMap,
    /// `?token=` query parameter, if any.
    pub token: Option<String>,
}

impl UpgradeRequest {
    /// Token from the query string, falling back to a bearer header.
    pub fn credential(&self) -> Option<&str> {
        self.token.as_deref().or_else(|| bearer_token(&self.headers))
    }
}

/// An admitted agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDescriptor {
    /// Key the agent is registered under.
    pub key: String,
}

/// Decides whether a connection attempt becomes an agent.
///
/// Return [`TunnelError::AuthRejected`] to refuse with a specific status;
/// any other error is treated as a gate failure (`500`).
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        request: &'a UpgradeRequest,
    ) -> BoxFuture<'a, Result<AgentDescriptor, TunnelError>>;
}

/// Admits every syntactically valid key. Used when no tunnel key is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate<'a>(
        &'a self,
        request: &'a UpgradeRequest,
    ) -> BoxFuture<'a, Result<AgentDescriptor, TunnelError>> {
        Box::pin(async move {
            Ok(AgentDescriptor {
                key: request.key.clone(),
            })
        })
    }
}

/// Requires the pre-shared tunnel key.
#[derive(Clone)]
pub struct SharedKey {
    tunnel_key: String,
}

impl SharedKey {
    pub fn new(tunnel_key: impl Into<String>) -> Self {
        Self {
            tunnel_key: tunnel_key.into(),
        }
    }

    /// Whether `provided` matches the configured key.
    pub fn accepts(&self, provided: Option<&str>) -> bool {
        provided.is_some_and(|p| constant_time_eq(self.tunnel_key.as_bytes(), p.as_bytes()))
    }
}

impl Authenticator for SharedKey {
    fn authenticate<'a>(
        &'a self,
        request: &'a UpgradeRequest,
    ) -> BoxFuture<'a, Result<AgentDescriptor, TunnelError>> {
        Box::pin(async move {
            if !self.accepts(request.credential()) {
                return Err(TunnelError::AuthRejected {
                    status: StatusCode::FORBIDDEN,
                    message: "Invalid tunnel key".to_string(),
                });
            }
            Ok(AgentDescriptor {
                key: request.key.clone(),
            })
        })
    }
}

/// `Authorization: Bearer <token>` value, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn upgrade(token: Option<&str>) -> UpgradeRequest {
        UpgradeRequest {
            key: "client-1".into(),
            headers: HeaderMap::new(),
            token: token.map(ToString::to_string),
        }
    }

    #[test]
    fn constant_time_eq_compares_content_and_length() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[tokio::test]
    async fn allow_all_admits_requested_key() {
        let admitted = AllowAll.authenticate(&upgrade(None)).await.unwrap();
        assert_eq!(admitted.key, "client-1");
    }

    #[tokio::test]
    async fn shared_key_rejects_missing_or_wrong_token() {
        let gate = SharedKey::new("s3cret");
        for token in [None, Some("wrong")] {
            match gate.authenticate(&upgrade(token)).await {
                Err(TunnelError::AuthRejected { status, message }) => {
                    assert_eq!(status, StatusCode::FORBIDDEN);
                    assert_eq!(message, "Invalid tunnel key");
                }
                other => panic!("expected rejection, got {other:?}"),
            }
        }
        assert!(gate.authenticate(&upgrade(Some("s3cret"))).await.is_ok());
    }

    #[tokio::test]
    async fn shared_key_accepts_bearer_header() {
        let gate = SharedKey::new("s3cret");
        let mut request = upgrade(None);
        request
            .headers
            .insert("authorization", HeaderValue::from_static("Bearer s3cret"));
        assert!(gate.authenticate(&request).await.is_ok());
    }
}
