//! Run orchestration: ramp-up, duration timer, stop broadcast and drain.
//!
//! # High-level flow
//! 1. A shared [`ExecutionContext`] holds the stop signal and the live user gauges.
//! 2. One ramp task per enabled protocol spawns virtual users at `spawn_rate` users
//!    per second until `users_per_protocol` is reached. All protocols ramp in parallel.
//! 3. A timer task flips the stop signal once `duration` has elapsed, counted from
//!    the start of ramp-up. [`RunHandle::stop`] flips the same signal early.
//! 4. On stop, ramps stop spawning, users finish (or abandon) their current attempt,
//!    and the driver waits for all of them, bounded by the grace period. Users that
//!    still have not returned are aborted.
//!
//! # Ramp governor
//! The ramp is a governor ticking every `spawn_tick`. Each tick it computes how many
//! users to spawn:
//!
//! ```text
//! add_f = spawn_rate * tick_seconds
//! add_total = floor(add_f + fractional)
//! fractional = (add_f + fractional) - add_total
//! ```
//!
//! Carrying `fractional` across ticks keeps the long-term rate exact even when a
//! single tick is worth less than one user. It starts at `1.0`, so the first user
//! of every protocol is spawned immediately.
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::{
    sync::watch::{self, Receiver, Sender},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    aggregate::ProtocolAggregate,
    collector::MetricsCollector,
    config::RunConfig,
    error::{ConfigError, RunError},
    message::LightMessage,
    protocol::{ClientFactory, Exchange, Protocol, ProtocolClient},
    report::FinalReport,
    user::{UserSummary, VirtualUser},
};

/// Extra time granted to the drain on top of the grace period, covering the last
/// record write and task teardown.
const DRAIN_SLACK: Duration = Duration::from_millis(500);

/// Live user counts for one protocol.
#[derive(Debug, Default)]
pub struct Gauge {
    active: AtomicUsize,
    spawned: AtomicUsize,
}

impl Gauge {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }
}

/// Shared execution state for the ramps, the timer and every virtual user.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Broadcasts the signal to stop all tasks.
    pub stop: Receiver<bool>,
    pub gauges: Arc<BTreeMap<Protocol, Arc<Gauge>>>,
    next_user: Arc<AtomicUsize>,
}

impl ExecutionContext {
    pub fn new(protocols: &[Protocol]) -> (Self, Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let gauges = protocols
            .iter()
            .map(|p| (*p, Arc::new(Gauge::default())))
            .collect();
        (
            Self {
                stop: rx,
                gauges: Arc::new(gauges),
                next_user: Arc::new(AtomicUsize::new(0)),
            },
            tx,
        )
    }

    fn gauge(&self, protocol: Protocol) -> Arc<Gauge> {
        self.gauges.get(&protocol).cloned().unwrap_or_default()
    }
}

/// How the run went, as opposed to what it measured.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    /// From the start of ramp-up until the drain finished.
    pub elapsed: Duration,
    /// From the start of ramp-up until the stop signal.
    pub active: Duration,
    /// Users spawned per protocol.
    pub users: BTreeMap<Protocol, usize>,
    /// Attempts that outlived the grace period and were recorded as timeouts.
    pub abandoned_attempts: usize,
    /// Users that did not return within the drain bound and were aborted.
    pub aborted_users: usize,
    /// Stopped through [`RunHandle::stop`] before the configured duration.
    pub stopped_early: bool,
}

impl RunSummary {
    pub fn drained_cleanly(&self) -> bool {
        self.aborted_users == 0
    }

    /// Reached the full duration and every user returned on its own.
    pub fn completed(&self) -> bool {
        !self.stopped_early && self.drained_cleanly()
    }
}

/// Owns a validated configuration and the way to reach the servers.
pub struct Scheduler<F: ClientFactory> {
    config: Arc<RunConfig>,
    factory: Arc<F>,
    collector: Arc<MetricsCollector>,
}

impl<F: ClientFactory> Scheduler<F> {
    pub fn new(config: RunConfig, factory: F) -> Result<Self, ConfigError> {
        config.validate()?;
        let collector = Arc::new(MetricsCollector::new(config.enabled_protocols()));
        Ok(Self {
            config: Arc::new(config),
            factory: Arc::new(factory),
            collector,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Sends one request per enabled protocol, without recording anything.
    ///
    /// A protocol counts as reachable if a server answered at all, even with a
    /// malformed response.
    pub async fn probe(&self) -> BTreeMap<Protocol, Exchange> {
        let probes = self.config.enabled_protocols().into_iter().map(|protocol| {
            let client = self.factory.connect(protocol);
            let timeout = self.config.request_timeout;
            let message = LightMessage::fetch(self.config.car_name.clone());
            async move {
                let request = client.encode(&message, 0);
                (protocol, client.exchange(request, timeout).await)
            }
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Starts ramp-up for every enabled protocol and returns immediately.
    pub fn start(self) -> RunHandle {
        let protocols = self.config.enabled_protocols();
        let (ctx, stop_tx) = ExecutionContext::new(&protocols);
        let stop_tx = Arc::new(stop_tx);
        let started_at = Utc::now();
        let start = Instant::now();

        tracing::info!(
            "starting run: {} users per protocol at {}/s for {:?} ({})",
            self.config.users_per_protocol,
            self.config.spawn_rate,
            self.config.duration,
            protocols
                .iter()
                .map(Protocol::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );

        let ramps: Vec<_> = protocols
            .iter()
            .map(|protocol| {
                tokio::spawn(ramp_task(
                    ctx.clone(),
                    *protocol,
                    self.factory.clone(),
                    self.config.clone(),
                    self.collector.clone(),
                ))
            })
            .collect();

        tokio::spawn(timer_task(ctx.stop.clone(), stop_tx.clone(), self.config.duration));

        let driver = tokio::spawn(drive(
            ctx.clone(),
            ramps,
            self.config.clone(),
            started_at,
            start,
        ));

        RunHandle {
            stop: StopSignal(stop_tx),
            ctx,
            collector: self.collector,
            driver,
        }
    }
}

/// Cloneable handle that stops a run from anywhere, e.g. a Ctrl-C listener.
#[derive(Clone)]
pub struct StopSignal(Arc<Sender<bool>>);

impl StopSignal {
    /// Idempotent; only the first call has an effect.
    pub fn stop(&self) {
        if !self.0.send_replace(true) {
            tracing::info!("stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

/// A run in progress.
pub struct RunHandle {
    stop: StopSignal,
    ctx: ExecutionContext,
    collector: Arc<MetricsCollector>,
    driver: JoinHandle<RunSummary>,
}

impl RunHandle {
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Users of `protocol` currently running.
    pub fn active_users(&self, protocol: Protocol) -> usize {
        self.ctx.gauges.get(&protocol).map_or(0, |g| g.active())
    }

    pub fn total_active_users(&self) -> usize {
        self.ctx.gauges.values().map(|g| g.active()).sum()
    }

    pub fn spawned_users(&self, protocol: Protocol) -> usize {
        self.ctx.gauges.get(&protocol).map_or(0, |g| g.spawned())
    }

    pub fn snapshot(&self) -> BTreeMap<Protocol, ProtocolAggregate> {
        self.collector.snapshot()
    }

    /// Waits for the run to end and drain, then closes the collector.
    pub async fn join(self) -> Result<FinalReport, RunError> {
        let summary = self.driver.await?;
        let mut report = self.collector.finalize()?;
        if report.rejected > 0 {
            tracing::warn!("{} records were rejected by the collector", report.rejected);
        }
        report.attach_run(summary);
        Ok(report)
    }
}

async fn timer_task(mut stop: Receiver<bool>, stop_tx: Arc<Sender<bool>>, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {
            tracing::info!("run duration of {duration:?} elapsed, stopping");
            stop_tx.send_replace(true);
        }
        _ = stop.wait_for(|s| *s) => {}
    }
}

/// Spawns the users of one protocol following the ramp governor.
async fn ramp_task<F: ClientFactory>(
    mut ctx: ExecutionContext,
    protocol: Protocol,
    factory: Arc<F>,
    config: Arc<RunConfig>,
    collector: Arc<MetricsCollector>,
) -> Vec<JoinHandle<UserSummary>> {
    let target = config.users_per_protocol;
    let mut users = Vec::with_capacity(target);
    let mut fractional = 1.0;
    let mut next_tick = Instant::now();

    tracing::debug!(%protocol, "ramping up to {target} users");
    while users.len() < target && !*ctx.stop.borrow() {
        let (add, f) = calc_spawn_count(config.spawn_rate, config.spawn_tick, fractional);
        fractional = f;
        for _ in 0..add.min(target - users.len()) {
            users.push(spawn_user(&ctx, protocol, &*factory, &config, &collector));
        }
        if users.len() >= target {
            tracing::info!(%protocol, "all {target} users spawned");
            break;
        }

        next_tick += config.spawn_tick;
        tokio::select! {
            _ = tokio::time::sleep_until(next_tick) => {}
            _ = ctx.stop.wait_for(|s| *s) => {
                tracing::debug!(%protocol, "ramp interrupted at {} users", users.len());
            }
        }
    }
    users
}

fn spawn_user<F: ClientFactory>(
    ctx: &ExecutionContext,
    protocol: Protocol,
    factory: &F,
    config: &Arc<RunConfig>,
    collector: &Arc<MetricsCollector>,
) -> JoinHandle<UserSummary> {
    let id = ctx.next_user.fetch_add(1, Ordering::Relaxed);
    let user = VirtualUser::new(id, factory.connect(protocol), config.clone(), collector.clone());
    let gauge = ctx.gauge(protocol);
    gauge.spawned.fetch_add(1, Ordering::Relaxed);
    gauge.active.fetch_add(1, Ordering::Relaxed);
    let stop = ctx.stop.clone();
    tokio::spawn(async move {
        let summary = user.run(stop).await;
        gauge.active.fetch_sub(1, Ordering::Relaxed);
        summary
    })
}

/// Waits for the stop signal, then drains every user within the grace bound.
async fn drive(
    mut ctx: ExecutionContext,
    ramps: Vec<JoinHandle<Vec<JoinHandle<UserSummary>>>>,
    config: Arc<RunConfig>,
    started_at: DateTime<Utc>,
    start: Instant,
) -> RunSummary {
    // An error only means every sender is gone, which is as good as a stop.
    let _ = ctx.stop.wait_for(|s| *s).await;
    let active = start.elapsed();
    let stopped_early = active < config.duration;
    tracing::info!("stop broadcast after {active:?}, draining users");

    let mut users = Vec::new();
    for ramp in join_all(ramps).await {
        match ramp {
            Ok(handles) => users.extend(handles),
            Err(e) => tracing::error!("ramp task failed: {e}"),
        }
    }

    let aborts: Vec<_> = users.iter().map(JoinHandle::abort_handle).collect();
    let mut abandoned_attempts = 0;
    let mut aborted_users = 0;
    match tokio::time::timeout(config.grace_period + DRAIN_SLACK, join_all(users)).await {
        Ok(results) => {
            for res in results {
                match res {
                    Ok(summary) => abandoned_attempts += usize::from(summary.abandoned),
                    // A panicking user loses only its own in-flight attempt.
                    Err(e) => tracing::error!("user task failed: {e}"),
                }
            }
        }
        Err(_) => {
            aborted_users = aborts.iter().filter(|a| !a.is_finished()).count();
            tracing::warn!("{aborted_users} users did not stop in time, aborting them");
            aborts.iter().for_each(|a| a.abort());
        }
    }

    let users = ctx
        .gauges
        .iter()
        .map(|(p, g)| (*p, g.spawned()))
        .collect();
    let elapsed = start.elapsed();
    tracing::info!("run finished after {elapsed:?}");
    RunSummary {
        started_at,
        elapsed,
        active,
        users,
        abandoned_attempts,
        aborted_users,
        stopped_early,
    }
}

/// Pure function computing how many users to spawn this tick.
///
/// Returns `(users_to_spawn, next_fractional_part)`.
pub fn calc_spawn_count(rate: f64, tick: Duration, fractional: f64) -> (usize, f64) {
    let add_f = rate * tick.as_secs_f64();
    let add_total_f = (add_f + fractional).floor();
    let fractional = (add_f + fractional) - add_total_f;

    let add_total = if add_total_f >= usize::MAX as f64 {
        usize::MAX
    } else if add_total_f < 0.0 {
        0
    } else {
        add_total_f as usize
    };
    (add_total, fractional)
}
