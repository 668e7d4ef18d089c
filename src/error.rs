//! Error taxonomy (C1). Converts a raw server error frame into one of a
//! fixed set of kinds the rest of the engine reasons about.

use serde::Deserialize;
use std::time::SystemTime;

/// Metadata attached to a `TooManyRequests` error, used to drive
/// subscribe-locks (C5) and synchronize-cooldowns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitMetadata {
    pub kind: RateLimitKind,
    pub recommended_retry_time: SystemTime,
    pub locked_at_accounts: usize,
}

/// The three rate-limit scopes the gateway can signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitKind {
    /// `LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER` — global, pool-wide.
    PerUser,
    /// `LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_SERVER` — scoped to one socket.
    PerServer,
    /// `LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER_PER_SERVER` — scoped to one socket.
    PerUserPerServer,
}

impl RateLimitKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER" => Some(Self::PerUser),
            "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_SERVER" => Some(Self::PerServer),
            "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER_PER_SERVER" => Some(Self::PerUserPerServer),
            _ => None,
        }
    }

    /// True for the two per-socket scopes (as opposed to the pool-wide one).
    pub fn is_per_socket(self) -> bool {
        !matches!(self, Self::PerUser)
    }
}

/// The error taxonomy from spec §4.1. Every RPC failure and server error
/// frame is classified into exactly one of these.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("not found: {message}")]
    NotFound { message: String },

    #[error("account not synchronized: {message}")]
    NotSynchronized { message: String },

    #[error("request timed out: {message}")]
    Timeout { message: String },

    #[error("not connected: {message}")]
    NotConnected { message: String },

    #[error("trade error {numeric_code:?}/{string_code:?}: {message}")]
    Trade {
        message: String,
        numeric_code: Option<i64>,
        string_code: Option<String>,
    },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("too many requests: {message}")]
    TooManyRequests {
        message: String,
        metadata: Option<RateLimitMetadata>,
    },

    #[error("internal error: {message}")]
    Internal { message: String },

    /// The socket carrying the request/subscription was closed out from
    /// under the caller (pool close, or reassignment during retry).
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<crate::transport::TransportError> for GatewayError {
    fn from(err: crate::transport::TransportError) -> Self {
        match err {
            crate::transport::TransportError::ConnectTimeout => Self::Timeout {
                message: "connect timed out".into(),
            },
            other => Self::NotConnected { message: other.to_string() },
        }
    }
}

impl GatewayError {
    /// Whether §4.6's retry loop should treat this as retriable, absent
    /// the `TooManyRequests`-specific recommended-retry-time logic.
    pub fn is_generically_retriable(&self) -> bool {
        matches!(
            self,
            Self::NotSynchronized { .. } | Self::Timeout { .. } | Self::NotConnected { .. } | Self::Internal { .. }
        )
    }
}

/// Wire shape of an inbound error-carrying response envelope, per §6.
#[derive(Debug, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(rename = "numericCode")]
    pub numeric_code: Option<i64>,
    #[serde(rename = "stringCode")]
    pub string_code: Option<String>,
    #[serde(default)]
    pub metadata: Option<RawRateLimitMetadata>,
}

#[derive(Debug, Deserialize)]
pub struct RawRateLimitMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "recommendedRetryTime")]
    pub recommended_retry_time: String,
    #[serde(rename = "lockedAtAccounts")]
    pub locked_at_accounts: usize,
}

/// Classifies a raw server error frame into a [`GatewayError`] (§4.1).
pub fn classify(frame: ErrorFrame) -> GatewayError {
    let message = frame.message;
    match frame.error.as_str() {
        "ValidationError" => GatewayError::Validation { message },
        "NotFoundError" => GatewayError::NotFound { message },
        "NotSynchronizedError" => GatewayError::NotSynchronized { message },
        "TimeoutError" => GatewayError::Timeout { message },
        "NotConnectedError" | "NotAuthenticatedError" => GatewayError::NotConnected { message },
        "TradeError" => GatewayError::Trade {
            message,
            numeric_code: frame.numeric_code,
            string_code: frame.string_code,
        },
        "UnauthorizedError" => GatewayError::Unauthorized { message },
        "TooManyRequestsError" => {
            let metadata = frame.metadata.and_then(|m| {
                let kind = RateLimitKind::parse(&m.kind)?;
                let recommended_retry_time = crate::model::parse_timestamp(&m.recommended_retry_time)?;
                Some(RateLimitMetadata {
                    kind,
                    recommended_retry_time,
                    locked_at_accounts: m.locked_at_accounts,
                })
            });
            GatewayError::TooManyRequests { message, metadata }
        }
        _ => GatewayError::Internal { message },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_kinds() {
        let frame = ErrorFrame {
            error: "NotSynchronizedError".into(),
            message: "not ready".into(),
            details: None,
            numeric_code: None,
            string_code: None,
            metadata: None,
        };
        assert!(matches!(classify(frame), GatewayError::NotSynchronized { .. }));
    }

    #[test]
    fn unknown_error_becomes_internal() {
        let frame = ErrorFrame {
            error: "SomethingWeird".into(),
            message: "???".into(),
            details: None,
            numeric_code: None,
            string_code: None,
            metadata: None,
        };
        assert!(matches!(classify(frame), GatewayError::Internal { .. }));
    }

    #[test]
    fn too_many_requests_carries_metadata() {
        let frame = ErrorFrame {
            error: "TooManyRequestsError".into(),
            message: "slow down".into(),
            details: None,
            numeric_code: None,
            string_code: None,
            metadata: Some(RawRateLimitMetadata {
                kind: "LIMIT_ACCOUNT_SUBSCRIPTIONS_PER_USER".into(),
                recommended_retry_time: "2024-01-01T00:00:00.000Z".into(),
                locked_at_accounts: 2,
            }),
        };
        match classify(frame) {
            GatewayError::TooManyRequests { metadata: Some(m), .. } => {
                assert_eq!(m.kind, RateLimitKind::PerUser);
                assert_eq!(m.locked_at_accounts, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
