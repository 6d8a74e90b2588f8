use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{
    fmt::Debug,
    future::Future,
    io::Write,
    path::{Path, PathBuf},
};

use crate::{
    Aggregate,
    aggregate::ProtocolAggregate,
    error::{ReportError, TransportErrorKind},
    metric::ResultRecord,
    protocol::Protocol,
    scheduler::RunSummary,
};

/// A [`Report`] is the processed form of an [`Aggregate`]: averages, percentiles,
/// ratios and totals.
///
/// Reports are plain data. They do no I/O and are derived deterministically from an
/// aggregate, which means a report can be rebuilt from a mid-run snapshot just as well
/// as from the final state of the collector.
pub trait Report<A>
where
    Self: Send + Sync + Debug + Serialize + DeserializeOwned,
    A: Aggregate,
{
    fn from_aggregate(protocol: Protocol, aggregate: &A) -> Self;
}

/// A [`Reporter`] is the I/O boundary: it takes a finished report and shows or
/// persists it somewhere.
pub trait Reporter {
    fn report(&self, report: &FinalReport) -> impl Future<Output = Result<(), ReportError>>;
}

/// Per-protocol results. Flat on purpose so it maps onto a single CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub protocol: Protocol,
    pub requests: u64,
    pub failures: u64,
    /// Between 0 and 1.
    pub failure_ratio: f64,
    pub timeouts: u64,
    pub refused: u64,
    pub malformed: u64,
    /// Attempts per second of active run time. Zero until a run summary is attached.
    pub requests_per_sec: f64,
    pub latency_mean_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p90_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_max_ms: f64,
    pub request_bytes_mean: f64,
    pub request_bytes_p50: u64,
    pub request_bytes_p95: u64,
    pub request_bytes_p99: u64,
    pub response_bytes_mean: f64,
    pub response_bytes_p50: u64,
    pub response_bytes_p95: u64,
    pub response_bytes_p99: u64,
}

fn ratio(part: f64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part / whole as f64 }
}

fn micros_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

impl Report<ProtocolAggregate> for Summary {
    fn from_aggregate(protocol: Protocol, agg: &ProtocolAggregate) -> Self {
        let successes = agg.successes();
        let kind = |k| agg.failures_by_kind.get(&k).copied().unwrap_or(0);
        Self {
            protocol,
            requests: agg.requests,
            failures: agg.failures,
            failure_ratio: ratio(agg.failures as f64, agg.requests),
            timeouts: kind(TransportErrorKind::Timeout),
            refused: kind(TransportErrorKind::ConnectionRefused),
            malformed: kind(TransportErrorKind::MalformedResponse),
            requests_per_sec: 0.0,
            latency_mean_ms: ratio(agg.total_latency.as_secs_f64() * 1000.0, successes),
            latency_p50_ms: micros_to_ms(agg.latency_us.value_at_quantile(0.50)),
            latency_p90_ms: micros_to_ms(agg.latency_us.value_at_quantile(0.90)),
            latency_p95_ms: micros_to_ms(agg.latency_us.value_at_quantile(0.95)),
            latency_p99_ms: micros_to_ms(agg.latency_us.value_at_quantile(0.99)),
            latency_max_ms: micros_to_ms(agg.latency_us.max()),
            request_bytes_mean: ratio(agg.total_request_bytes as f64, successes),
            request_bytes_p50: agg.request_bytes.value_at_quantile(0.50),
            request_bytes_p95: agg.request_bytes.value_at_quantile(0.95),
            request_bytes_p99: agg.request_bytes.value_at_quantile(0.99),
            response_bytes_mean: ratio(agg.total_response_bytes as f64, successes),
            response_bytes_p50: agg.response_bytes.value_at_quantile(0.50),
            response_bytes_p95: agg.response_bytes.value_at_quantile(0.95),
            response_bytes_p99: agg.response_bytes.value_at_quantile(0.99),
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    /// One entry per enabled protocol, in protocol order.
    pub summaries: Vec<Summary>,
    /// Every attempt, ordered by dispatch time.
    #[serde(skip)]
    pub records: Vec<ResultRecord>,
    /// Records the collector refused to account for.
    pub rejected: u64,
    pub run: Option<RunSummary>,
}

impl FinalReport {
    pub fn summary(&self, protocol: Protocol) -> Option<&Summary> {
        self.summaries.iter().find(|s| s.protocol == protocol)
    }

    /// Stores the run information and derives each protocol's throughput from the
    /// active span.
    pub fn attach_run(&mut self, run: RunSummary) {
        let active = run.active.as_secs_f64();
        for s in &mut self.summaries {
            s.requests_per_sec = if active > 0.0 { s.requests as f64 / active } else { 0.0 };
        }
        self.run = Some(run);
    }
}

/// Prints a fixed-width comparison table.
pub struct StdoutReporter;

impl StdoutReporter {
    pub fn render(report: &FinalReport) -> String {
        let mut out = String::new();
        if let Some(run) = &report.run {
            out.push_str(&format!(
                "run started {} | {:.1}s | users {}\n",
                run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                run.elapsed.as_secs_f64(),
                run.users
                    .iter()
                    .map(|(p, n)| format!("{p}={n}"))
                    .collect::<Vec<_>>()
                    .join(" "),
            ));
        }
        out.push_str(&format!(
            "{:<8} {:>9} {:>8} {:>7} {:>8} {:>9} {:>8} {:>8} {:>8} {:>8} {:>9} {:>9}\n",
            "protocol", "requests", "failures", "fail%", "req/s", "mean ms", "p50 ms", "p90 ms",
            "p95 ms", "p99 ms", "req B", "resp B",
        ));
        for s in &report.summaries {
            out.push_str(&format!(
                "{:<8} {:>9} {:>8} {:>6.2}% {:>8.1} {:>9.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>9.1} {:>9.1}\n",
                s.protocol.as_str(),
                s.requests,
                s.failures,
                s.failure_ratio * 100.0,
                s.requests_per_sec,
                s.latency_mean_ms,
                s.latency_p50_ms,
                s.latency_p90_ms,
                s.latency_p95_ms,
                s.latency_p99_ms,
                s.request_bytes_mean,
                s.response_bytes_mean,
            ));
        }
        for s in report.summaries.iter().filter(|s| s.failures > 0) {
            out.push_str(&format!(
                "{}: {} timeouts, {} refused, {} malformed\n",
                s.protocol, s.timeouts, s.refused, s.malformed
            ));
        }
        out
    }
}

impl Reporter for StdoutReporter {
    async fn report(&self, report: &FinalReport) -> Result<(), ReportError> {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(Self::render(report).as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

/// Prints the summaries and run information as pretty JSON.
pub struct JsonReporter;

impl Reporter for JsonReporter {
    async fn report(&self, report: &FinalReport) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(report)?;
        println!("{json}");
        Ok(())
    }
}

const RECORD_HEADER: [&str; 10] = [
    "timestamp",
    "protocol",
    "user",
    "sequence",
    "success",
    "failure_kind",
    "failure_reason",
    "latency_ms",
    "request_bytes",
    "response_bytes",
];

#[derive(Serialize)]
struct RecordRow<'a> {
    timestamp: String,
    protocol: Protocol,
    user: usize,
    sequence: u64,
    success: bool,
    failure_kind: Option<TransportErrorKind>,
    failure_reason: Option<&'a str>,
    latency_ms: f64,
    request_bytes: usize,
    response_bytes: usize,
}

impl<'a> From<&'a ResultRecord> for RecordRow<'a> {
    fn from(r: &'a ResultRecord) -> Self {
        let failure = r.failure();
        Self {
            timestamp: r.timestamp.to_rfc3339(),
            protocol: r.protocol,
            user: r.user,
            sequence: r.sequence,
            success: failure.is_none(),
            failure_kind: failure.map(|f| f.kind),
            failure_reason: failure.map(|f| f.reason.as_str()),
            latency_ms: r.latency.as_secs_f64() * 1000.0,
            request_bytes: r.request_bytes,
            response_bytes: r.response_bytes,
        }
    }
}

/// Writes one row per attempt to `path` and one row per protocol to
/// `<stem>_summary.<ext>` next to it.
pub struct CsvReporter {
    path: PathBuf,
}

impl CsvReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn records_path(&self) -> &Path {
        &self.path
    }

    pub fn summary_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "results".to_owned());
        let ext = self
            .path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "csv".to_owned());
        self.path.with_file_name(format!("{stem}_summary.{ext}"))
    }
}

impl Reporter for CsvReporter {
    async fn report(&self, report: &FinalReport) -> Result<(), ReportError> {
        let mut records = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&self.path)?;
        // Written by hand so an empty run still yields a header row.
        records.write_record(RECORD_HEADER)?;
        for r in &report.records {
            records.serialize(RecordRow::from(r))?;
        }
        records.flush()?;

        let summary_path = self.summary_path();
        let mut summaries = csv::Writer::from_path(&summary_path)?;
        for s in &report.summaries {
            summaries.serialize(s)?;
        }
        summaries.flush()?;

        tracing::info!(
            "wrote {} records to {} and summaries to {}",
            report.records.len(),
            self.path.display(),
            summary_path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use std::collections::BTreeMap;

    use super::*;
    use crate::{error::TransportError, metric::Outcome};

    fn record(sequence: u64, latency_ms: u64, outcome: Outcome) -> ResultRecord {
        ResultRecord {
            protocol: Protocol::Rest,
            timestamp: Utc::now(),
            user: 0,
            sequence,
            request_bytes: 25,
            response_bytes: 90,
            latency: Duration::from_millis(latency_ms),
            outcome,
        }
    }

    fn report() -> FinalReport {
        let records: Vec<_> = (1..=100)
            .map(|i| {
                let outcome = if i % 20 == 0 {
                    Outcome::Failure(TransportError::refused("nobody home"))
                } else {
                    Outcome::Success
                };
                record(i, i, outcome)
            })
            .collect();
        let mut agg = ProtocolAggregate::new();
        agg.aggregate(&records);
        FinalReport {
            summaries: vec![Summary::from_aggregate(Protocol::Rest, &agg)],
            records,
            rejected: 0,
            run: None,
        }
    }

    #[test]
    fn summary_statistics() {
        let report = report();
        let s = report.summary(Protocol::Rest).unwrap();
        assert_eq!(s.requests, 100);
        assert_eq!(s.failures, 5);
        assert_eq!(s.refused, 5);
        assert!((s.failure_ratio - 0.05).abs() < 1e-9);
        assert_eq!(s.request_bytes_mean, 25.0);
        assert_eq!(s.response_bytes_p99, 90);
        assert!((s.latency_p50_ms - 50.0).abs() < 1.0, "{}", s.latency_p50_ms);
        assert!(s.latency_max_ms >= 99.0 && s.latency_max_ms < 99.2);
        assert!((s.latency_p90_ms - 90.0).abs() < 1.1, "{}", s.latency_p90_ms);
        assert_eq!(s.requests_per_sec, 0.0);
    }

    #[test]
    fn throughput_follows_the_active_span() {
        let mut report = report();
        report.attach_run(RunSummary {
            started_at: Utc::now(),
            elapsed: Duration::from_secs(12),
            active: Duration::from_secs(10),
            users: BTreeMap::from([(Protocol::Rest, 4)]),
            abandoned_attempts: 0,
            aborted_users: 0,
            stopped_early: false,
        });
        let s = report.summary(Protocol::Rest).unwrap();
        assert!((s.requests_per_sec - 10.0).abs() < 1e-9);
        assert!(report.run.is_some());

        let table = StdoutReporter::render(&report);
        assert!(table.contains("req/s"));
        assert!(table.contains("p90 ms"));
    }

    #[test]
    fn empty_aggregate_reports_zeros() {
        let s = Summary::from_aggregate(Protocol::Coap, &ProtocolAggregate::new());
        assert_eq!(s.requests, 0);
        assert_eq!(s.failure_ratio, 0.0);
        assert_eq!(s.latency_mean_ms, 0.0);
        assert_eq!(s.latency_p99_ms, 0.0);
    }

    #[test]
    fn summary_file_sits_next_to_the_records() {
        let reporter = CsvReporter::new("/tmp/out/results.csv");
        assert_eq!(reporter.summary_path(), PathBuf::from("/tmp/out/results_summary.csv"));
        let bare = CsvReporter::new("run");
        assert_eq!(bare.summary_path(), PathBuf::from("run_summary.csv"));
    }

    #[test]
    fn table_lists_every_protocol() {
        let table = StdoutReporter::render(&report());
        assert!(table.contains("REST"));
        assert!(table.contains("5 refused"));
    }

    #[tokio::test]
    async fn csv_export_writes_records_and_summaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        let reporter = CsvReporter::new(&path);
        reporter.report(&report()).await.unwrap();

        let mut rows = csv::Reader::from_path(&path).unwrap();
        let headers = rows.headers().unwrap().clone();
        assert_eq!(&headers[1], "protocol");
        assert_eq!(rows.records().count(), 100);

        let mut summary = csv::Reader::from_path(reporter.summary_path()).unwrap();
        let rows: Vec<Summary> = summary.deserialize().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].requests, 100);
        assert_eq!(rows[0].protocol, Protocol::Rest);
    }

    #[tokio::test]
    async fn empty_run_still_writes_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        let empty = FinalReport {
            summaries: vec![Summary::from_aggregate(Protocol::Coap, &ProtocolAggregate::new())],
            records: Vec::new(),
            rejected: 0,
            run: None,
        };
        CsvReporter::new(&path).report(&empty).await.unwrap();

        let mut rows = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = rows.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, RECORD_HEADER);
        assert_eq!(rows.records().count(), 0);
    }
}
