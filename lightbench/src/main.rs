use std::{path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::{ArgAction, Parser, builder::BoolishValueParser};
use lightbench::{
    EndpointFactory, Reporter, RunConfig, Scheduler, ThinkTime,
    config::{
        DEFAULT_COAP_HOST, DEFAULT_COAP_PATH, DEFAULT_COAP_PORT, DEFAULT_JSONRPC_URL,
        DEFAULT_REST_URL, Endpoints, parse_duration,
    },
    error::TransportErrorKind,
    message::CAR_NAME,
    report::{CsvReporter, JsonReporter, StdoutReporter},
};
use tracing_subscriber::EnvFilter;

/// Load generator comparing REST, CoAP/CBOR and JSON-RPC for the same exterior-light
/// status exchange.
#[derive(Parser, Debug)]
#[command(name = "lightbench", version, about)]
struct Cli {
    #[arg(long, env = "REST_URL", default_value = DEFAULT_REST_URL)]
    rest_url: String,
    #[arg(long, env = "JSONRPC_URL", default_value = DEFAULT_JSONRPC_URL)]
    jsonrpc_url: String,
    #[arg(long, env = "COAP_HOST", default_value = DEFAULT_COAP_HOST)]
    coap_host: String,
    #[arg(long, env = "COAP_PORT", default_value_t = DEFAULT_COAP_PORT)]
    coap_port: u16,
    #[arg(long, env = "COAP_PATH", default_value = DEFAULT_COAP_PATH)]
    coap_path: String,

    #[arg(long, env = "ENABLE_REST", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    enable_rest: bool,
    #[arg(long, env = "ENABLE_COAP", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    enable_coap: bool,
    #[arg(long, env = "ENABLE_JSONRPC", default_value = "true", action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    enable_jsonrpc: bool,

    /// Virtual users per enabled protocol
    #[arg(short, long, default_value_t = 10)]
    users: usize,
    /// Users spawned per second, per protocol
    #[arg(short = 'r', long, default_value_t = 2.0)]
    spawn_rate: f64,
    /// Run duration, e.g. `90s`, `10m`
    #[arg(short = 't', long, default_value = "60s", value_parser = parse_duration)]
    run_time: Duration,
    #[arg(long, default_value = "10ms", value_parser = parse_duration)]
    think_min: Duration,
    #[arg(long, default_value = "50ms", value_parser = parse_duration)]
    think_max: Duration,
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    request_timeout: Duration,
    /// How long in-flight requests may finish after the run ends
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    grace_period: Duration,
    #[arg(long, default_value_t = 8)]
    max_backoff: u32,
    #[arg(long, default_value = CAR_NAME)]
    car_name: String,

    /// Per-request CSV; the summary is written next to it as `<stem>_summary.csv`
    #[arg(long)]
    csv: Option<PathBuf>,
    /// Also print the summary as JSON
    #[arg(long)]
    json: bool,
    /// Start even if no server answers the startup probe
    #[arg(long)]
    skip_probe: bool,
}

impl Cli {
    fn run_config(&self) -> RunConfig {
        let endpoints = Endpoints::builder()
            .rest_url(self.rest_url.clone())
            .jsonrpc_url(self.jsonrpc_url.clone())
            .coap_host(self.coap_host.clone())
            .coap_port(self.coap_port)
            .coap_path(self.coap_path.clone())
            .build();
        let config = RunConfig::builder()
            .endpoints(endpoints)
            .enable_rest(self.enable_rest)
            .enable_coap(self.enable_coap)
            .enable_jsonrpc(self.enable_jsonrpc)
            .users_per_protocol(self.users)
            .spawn_rate(self.spawn_rate)
            .duration(self.run_time)
            .think_time(ThinkTime::new(self.think_min, self.think_max))
            .request_timeout(self.request_timeout)
            .grace_period(self.grace_period)
            .max_backoff(self.max_backoff)
            .car_name(self.car_name.clone());
        match &self.csv {
            Some(path) => config.csv_output_path(path.clone()).build(),
            None => config.build(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.run_config();
    config.validate().context("invalid configuration")?;

    let factory = EndpointFactory::new(&config)?;
    let scheduler = Scheduler::new(config.clone(), factory)?;

    if !cli.skip_probe {
        let mut reachable = 0;
        for (protocol, exchange) in scheduler.probe().await {
            match &exchange.outcome {
                Ok(_) => {
                    reachable += 1;
                    tracing::info!(%protocol, "probe answered in {:?}", exchange.latency);
                }
                Err(err) if err.kind == TransportErrorKind::MalformedResponse => {
                    reachable += 1;
                    tracing::warn!(%protocol, "probe answered with a malformed response: {err}");
                }
                Err(err) => tracing::warn!(%protocol, "probe failed: {err}"),
            }
        }
        if reachable == 0 {
            bail!("no enabled protocol answered the startup probe");
        }
    }

    let run = scheduler.start();
    let stop = run.stop_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let report = run.join().await?;
    StdoutReporter.report(&report).await?;
    if cli.json {
        JsonReporter.report(&report).await?;
    }
    if let Some(path) = &config.csv_output_path {
        CsvReporter::new(path)
            .report(&report)
            .await
            .with_context(|| format!("failed to export results to {}", path.display()))?;
    }

    match &report.run {
        Some(run) if !run.drained_cleanly() => {
            bail!("{} users had to be aborted during shutdown", run.aborted_users)
        }
        Some(run) if run.stopped_early => bail!("run interrupted after {:?}", run.active),
        _ => Ok(()),
    }
}
