use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Protocol;

/// Configuration problems detected before a run starts. Always fatal.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no protocol is enabled")]
    NoProtocolEnabled,
    #[error("invalid {protocol} endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint {
        protocol: Protocol,
        endpoint: String,
        reason: String,
    },
    #[error("target concurrency must be at least 1")]
    NoUsers,
    #[error("spawn rate must be a positive number of users per second, got {0}")]
    InvalidSpawnRate(f64),
    #[error("run duration must be greater than zero")]
    ZeroDuration,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
    #[error("think-time range is inverted: {min_ms}ms > {max_ms}ms")]
    InvertedThinkTime { min_ms: u128, max_ms: u128 },
    #[error("failed to build http client: {0}")]
    HttpClient(String),
}

/// Why a single request attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportErrorKind {
    Timeout,
    ConnectionRefused,
    MalformedResponse,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection-refused",
            Self::MalformedResponse => "malformed-response",
        })
    }
}

/// A failed request attempt.
///
/// Transport errors are data: they end up inside a [`crate::ResultRecord`] and never
/// cross the virtual user boundary.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {reason}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub reason: String,
    /// Bytes received before the attempt was declared failed (only non-zero for
    /// malformed responses).
    #[serde(default)]
    pub response_bytes: usize,
}

impl TransportError {
    pub fn timeout(reason: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Timeout,
            reason: reason.into(),
            response_bytes: 0,
        }
    }

    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::ConnectionRefused,
            reason: reason.into(),
            response_bytes: 0,
        }
    }

    pub fn malformed(reason: impl Into<String>, response_bytes: usize) -> Self {
        Self {
            kind: TransportErrorKind::MalformedResponse,
            reason: reason.into(),
            response_bytes,
        }
    }

    /// Classifies an I/O error raised while talking to a server.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Self::timeout(err.to_string()),
            ErrorKind::InvalidData | ErrorKind::UnexpectedEof => Self::malformed(err.to_string(), 0),
            // Reset, aborted, unreachable and friends all mean nobody answered.
            _ => Self::refused(err.to_string()),
        }
    }

    /// Classifies a `reqwest` failure that happened before a full response was read.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_decode() || err.is_body() {
            Self::malformed(err.to_string(), 0)
        } else {
            Self::refused(err.to_string())
        }
    }
}

/// A record reached the collector that it cannot account for.
#[derive(Debug, Error, PartialEq)]
pub enum AggregationError {
    #[error("record tagged {0} but that protocol is not enabled for this run")]
    UnknownProtocol(Protocol),
    #[error("collector was already finalized")]
    Finalized,
}

/// The run could not be brought to a finished report.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run driver task failed: {0}")]
    Driver(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
}

/// Failures while exporting a report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("failed to encode json: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(
            TransportError::from_io(&refused).kind,
            TransportErrorKind::ConnectionRefused
        );

        let timed_out = std::io::Error::from(std::io::ErrorKind::TimedOut);
        assert_eq!(
            TransportError::from_io(&timed_out).kind,
            TransportErrorKind::Timeout
        );

        let garbage = std::io::Error::from(std::io::ErrorKind::InvalidData);
        assert_eq!(
            TransportError::from_io(&garbage).kind,
            TransportErrorKind::MalformedResponse
        );
    }

    #[test]
    fn kinds_display_like_their_serialized_form() {
        for kind in [
            TransportErrorKind::Timeout,
            TransportErrorKind::ConnectionRefused,
            TransportErrorKind::MalformedResponse,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json.trim_matches('"'), kind.to_string());
        }
    }
}
