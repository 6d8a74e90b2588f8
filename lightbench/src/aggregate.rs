use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use hdrhistogram::Histogram;

use crate::{Metric, error::TransportErrorKind, metric::ResultRecord};

/// The `Aggregate` trait defines how raw [`Metric`] values are collected and combined
/// into an intermediate, mergeable representation.
///
/// Aggregates keep counters, sums and histograms. They do **not** compute averages or
/// percentiles; that belongs to a [`crate::Report`], which is derived from an aggregate
/// once the run is over (or whenever a snapshot is taken).
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**. Records from different virtual
///   users arrive in arbitrary order, and feeding the same records through `consume` one
///   by one, through [`Aggregate::aggregate`] as a batch, or through several partial
///   aggregates that are merged afterwards must give the same result.
/// - `consume` sits on the hot path of every request and must stay cheap.
pub trait Aggregate
where
    Self: PartialEq + Send + Sync + Debug + Clone,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple metrics into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Latencies are kept in microseconds, up to an hour.
const LATENCY_MAX_US: u64 = 3_600_000_000;
/// Message sizes up to 16 MiB.
const SIZE_MAX_BYTES: u64 = 16 * 1024 * 1024;
const SIGNIFICANT_FIGURES: u8 = 3;

/// Per-protocol accumulator.
///
/// `requests` and the failure counters cover every attempt. Latency and size
/// distributions only cover successful attempts, so a refused or timed-out request
/// never skews the size or latency comparison between protocols.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolAggregate {
    pub requests: u64,
    pub failures: u64,
    pub failures_by_kind: BTreeMap<TransportErrorKind, u64>,
    pub total_latency: Duration,
    pub total_request_bytes: u128,
    pub total_response_bytes: u128,
    pub latency_us: Histogram<u64>,
    pub request_bytes: Histogram<u64>,
    pub response_bytes: Histogram<u64>,
}

impl ProtocolAggregate {
    pub fn successes(&self) -> u64 {
        self.requests - self.failures
    }
}

fn histogram(high: u64) -> Histogram<u64> {
    // Bounds are constants well inside what hdrhistogram accepts.
    Histogram::new_with_bounds(1, high, SIGNIFICANT_FIGURES)
        .expect("constant histogram bounds are valid")
}

fn merge_histogram(into: &mut Histogram<u64>, from: &Histogram<u64>) {
    if let Err(err) = into.add(from) {
        tracing::error!("dropping histogram samples while merging: {err}");
    }
}

impl Aggregate for ProtocolAggregate {
    type Metric = ResultRecord;

    fn new() -> Self {
        Self {
            requests: 0,
            failures: 0,
            failures_by_kind: BTreeMap::new(),
            total_latency: Duration::ZERO,
            total_request_bytes: 0,
            total_response_bytes: 0,
            latency_us: histogram(LATENCY_MAX_US),
            request_bytes: histogram(SIZE_MAX_BYTES),
            response_bytes: histogram(SIZE_MAX_BYTES),
        }
    }

    fn consume(&mut self, record: &ResultRecord) {
        self.requests += 1;
        if let Some(kind) = record.failure_kind() {
            self.failures += 1;
            *self.failures_by_kind.entry(kind).or_insert(0) += 1;
            return;
        }
        self.total_latency += record.latency;
        self.total_request_bytes += record.request_bytes as u128;
        self.total_response_bytes += record.response_bytes as u128;
        let micros = u64::try_from(record.latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_us.saturating_record(micros);
        self.request_bytes.saturating_record(record.request_bytes as u64);
        self.response_bytes.saturating_record(record.response_bytes as u64);
    }

    fn merge(&mut self, other: Self) {
        self.requests += other.requests;
        self.failures += other.failures;
        for (kind, count) in other.failures_by_kind {
            *self.failures_by_kind.entry(kind).or_insert(0) += count;
        }
        self.total_latency += other.total_latency;
        self.total_request_bytes += other.total_request_bytes;
        self.total_response_bytes += other.total_response_bytes;
        merge_histogram(&mut self.latency_us, &other.latency_us);
        merge_histogram(&mut self.request_bytes, &other.request_bytes);
        merge_histogram(&mut self.response_bytes, &other.response_bytes);
    }
}
