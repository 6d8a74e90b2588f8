use std::{fmt::Debug, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::{TransportError, TransportErrorKind},
    macros::metric,
    protocol::{Exchange, Protocol},
};

/// A `Metric` is a single observed measurement produced by one request attempt.
///
/// Metrics are the most granular level of data in a run. They are collected and
/// summarized by an [`crate::Aggregate`], then turned into a [`crate::Report`].
///
/// Use the [`metric`] attribute to derive the required traits:
///
/// ```rust
/// use lightbench::{Metric, macros::metric};
/// use std::time::Duration;
///
/// #[metric]
/// struct Ping {
///     latency: Duration,
/// }
/// ```
pub trait Metric
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure(TransportError),
}

/// Immutable record of one request attempt.
#[metric]
pub struct ResultRecord {
    pub protocol: Protocol,
    /// Wall-clock time the attempt was dispatched.
    pub timestamp: DateTime<Utc>,
    /// Virtual user that issued the attempt.
    pub user: usize,
    /// Position of the attempt within its user's sequence.
    pub sequence: u64,
    pub request_bytes: usize,
    pub response_bytes: usize,
    pub latency: Duration,
    pub outcome: Outcome,
}

impl ResultRecord {
    pub fn new(
        protocol: Protocol,
        user: usize,
        sequence: u64,
        timestamp: DateTime<Utc>,
        exchange: Exchange,
    ) -> Self {
        let response_bytes = exchange.response_bytes();
        Self {
            protocol,
            timestamp,
            user,
            sequence,
            request_bytes: exchange.request_bytes,
            response_bytes,
            latency: exchange.latency,
            outcome: match exchange.outcome {
                Ok(_) => Outcome::Success,
                Err(err) => Outcome::Failure(err),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    pub fn failure(&self) -> Option<&TransportError> {
        match &self.outcome {
            Outcome::Success => None,
            Outcome::Failure(err) => Some(err),
        }
    }

    pub fn failure_kind(&self) -> Option<TransportErrorKind> {
        self.failure().map(|err| err.kind)
    }
}
