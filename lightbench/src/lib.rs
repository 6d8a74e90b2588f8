//! Lightbench: a load generator comparing REST, CoAP/CBOR and JSON-RPC.
//!
//! Every protocol serves the same tiny exchange: a client names a car, the server
//! answers with the car's exterior-light state. Lightbench drives a fixed
//! population of virtual users against each enabled protocol at once and reports,
//! per protocol, how often requests fail and how latency and message size are
//! distributed.
//!
//! # Architecture
//!
//! - [`Scheduler`]: ramps up virtual users per protocol, runs them for the configured
//!   duration, broadcasts the stop signal and drains.
//! - [`VirtualUser`]: a closed request loop with think time, owning one
//!   [`ProtocolClient`].
//! - [`ProtocolClient`]: encode/send/decode for one wire protocol. [`Client`] is the
//!   closed set of real adapters; tests plug in their own.
//! - [`Metric`]: one observation. Every attempt yields exactly one [`ResultRecord`].
//! - [`Aggregate`]: a mergeable per-protocol accumulator fed by the
//!   [`MetricsCollector`].
//! - [`Report`] / [`Reporter`]: derived statistics and where they are written to.
//!
//! # Example
//!
//! ```rust,no_run
//! use lightbench::{EndpointFactory, Reporter, RunConfig, Scheduler, report::StdoutReporter};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::builder()
//!         .users_per_protocol(20)
//!         .spawn_rate(5.0)
//!         .duration(Duration::from_secs(30))
//!         .build();
//!     let factory = EndpointFactory::new(&config)?;
//!     let run = Scheduler::new(config, factory)?.start();
//!     let report = run.join().await?;
//!     StdoutReporter.report(&report).await?;
//!     Ok(())
//! }
//! ```

/// Mergeable per-protocol accumulators
pub mod aggregate;
/// Thread-safe record sink
pub mod collector;
pub mod config;
pub mod error;
/// The car / exterior-light payload shared by all protocols
pub mod message;
/// Single observations
pub mod metric;
pub mod protocol;
/// Reports and Reporters
pub mod report;
pub mod scheduler;
/// The virtual user state machine
pub mod user;

pub use aggregate::{Aggregate, ProtocolAggregate};
pub use collector::MetricsCollector;
pub use config::{Endpoints, RunConfig, ThinkTime};
pub use metric::{Metric, ResultRecord};
pub use protocol::{Client, ClientFactory, EndpointFactory, Protocol, ProtocolClient};
pub use report::{FinalReport, Report, Reporter};
pub use scheduler::{RunHandle, Scheduler};
pub use user::VirtualUser;

/// Procedural macros to reduce boilerplate
pub mod macros {
    pub use lightbench_macros::*;
}
