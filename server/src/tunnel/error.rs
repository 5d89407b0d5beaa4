//! Error taxonomy shared by both ends of the tunnel.
//!
//! Every failure in the tunneling path is one of these variants. Each maps
//! to an HTTP status and a stable `code` string, so the gateway can render
//! any of them as `{"error": ..., "code": ...}` without further context.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::message::ErrorDetail;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// A frame could not be decoded into a message.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The routing target has no connected agent.
    #[error("{0}")]
    NoSuchAgent(String),

    /// The agent went away while an exchange depended on it.
    #[error("{0}")]
    GatewayUnreachable(String),

    /// An event arrived that the exchange state machine does not allow.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The auth gate refused the connection attempt.
    #[error("{message}")]
    AuthRejected { status: StatusCode, message: String },

    /// The agent could not reach its local service.
    #[error("local service unreachable: {0}")]
    LocalServiceUnreachable(String),

    /// Registration refused: bad key, or the routing id is owned by another key.
    #[error("{0}")]
    DuplicateOrInvalid(String),

    /// The agent's forward base URL is unusable.
    #[error("invalid forward base url: {0}")]
    InvalidForwardBase(String),

    /// No event arrived before the exchange deadline.
    #[error("agent did not respond within {0} ms")]
    Timeout(u64),

    /// The peer reported an `error` event on the channel.
    #[error("remote error {}: {}", .0.code, .0.message)]
    Remote(ErrorDetail),
}

impl TunnelError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedMessage(_) | Self::DuplicateOrInvalid(_) => StatusCode::BAD_REQUEST,
            Self::NoSuchAgent(_)
            | Self::GatewayUnreachable(_)
            | Self::ProtocolViolation(_)
            | Self::LocalServiceUnreachable(_)
            | Self::Remote(_) => StatusCode::BAD_GATEWAY,
            Self::AuthRejected { status, .. } => *status,
            Self::InvalidForwardBase(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedMessage(_) => "MALFORMED_MESSAGE",
            Self::NoSuchAgent(_) => "NO_SUCH_AGENT",
            Self::GatewayUnreachable(_) => "GATEWAY_UNREACHABLE",
            Self::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Self::AuthRejected { .. } => "AUTH_REJECTED",
            Self::LocalServiceUnreachable(_) => "LOCAL_SERVICE_UNREACHABLE",
            Self::DuplicateOrInvalid(_) => "DUPLICATE_OR_INVALID",
            Self::InvalidForwardBase(_) => "INVALID_FORWARD_BASE",
            Self::Timeout(_) => "TIMEOUT",
            Self::Remote(_) => "REMOTE_ERROR",
        }
    }

    /// Wire form of this error, for sending as an `error` event.
    pub fn to_detail(&self) -> ErrorDetail {
        match self {
            Self::Remote(detail) => detail.clone(),
            other => ErrorDetail::new(other.code(), other.to_string()),
        }
    }
}

impl IntoResponse for TunnelError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            // Replayed verbatim: the agent's serialized error is the body.
            Self::Remote(detail) => (status, Json(detail)).into_response(),
            other => (
                status,
                Json(json!({"error": other.to_string(), "code": other.code()})),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_failures_are_bad_gateway() {
        assert_eq!(
            TunnelError::NoSuchAgent("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TunnelError::GatewayUnreachable("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            TunnelError::ProtocolViolation("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn auth_rejection_keeps_its_status() {
        let err = TunnelError::AuthRejected {
            status: StatusCode::FORBIDDEN,
            message: "Invalid tunnel key".into(),
        };
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.to_string(), "Invalid tunnel key");
    }

    #[test]
    fn remote_detail_passes_through() {
        let detail = ErrorDetail::new("ECONNREFUSED", "connect failed");
        let err = TunnelError::Remote(detail.clone());
        assert_eq!(err.to_detail(), detail);
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn local_error_becomes_detail_with_code() {
        let detail = TunnelError::Timeout(500).to_detail();
        assert_eq!(detail.code, "TIMEOUT");
        assert!(detail.message.contains("500 ms"));
    }
}
