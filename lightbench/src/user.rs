use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::watch::Receiver, time::Instant};

use crate::{
    collector::MetricsCollector,
    config::RunConfig,
    error::{TransportError, TransportErrorKind},
    message::LightMessage,
    metric::ResultRecord,
    protocol::{Exchange, Protocol, ProtocolClient},
};

/// Floor applied to the think time once a user starts backing off, so a zero think
/// time cannot turn a refusing server into a busy loop.
const MIN_BACKOFF_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    Idle,
    Requesting,
    Recording,
    ThinkTime,
    Stopped,
}

/// What a user reports back once it has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserSummary {
    pub id: usize,
    pub protocol: Protocol,
    pub attempts: u64,
    /// Whether the last attempt outlived the grace period and was cut short.
    pub abandoned: bool,
}

/// One simulated client issuing requests in a closed loop.
///
/// A user owns its protocol client, so no connection state is ever shared between
/// users. It keeps issuing requests until the stop signal flips; after that it starts
/// no new attempt, and an attempt already in flight gets `grace_period` to finish.
pub struct VirtualUser<C: ProtocolClient> {
    id: usize,
    client: C,
    config: Arc<RunConfig>,
    collector: Arc<MetricsCollector>,
    state: UserState,
    sequence: u64,
    consecutive_refusals: u32,
}

impl<C: ProtocolClient> VirtualUser<C> {
    pub fn new(
        id: usize,
        client: C,
        config: Arc<RunConfig>,
        collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            id,
            client,
            config,
            collector,
            state: UserState::Idle,
            sequence: 0,
            consecutive_refusals: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.client.protocol()
    }

    pub fn state(&self) -> UserState {
        self.state
    }

    fn transition(&mut self, next: UserState) {
        tracing::trace!(user = self.id, "{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub async fn run(mut self, mut stop: Receiver<bool>) -> UserSummary {
        let protocol = self.protocol();
        let mut abandoned = false;
        tracing::debug!(user = self.id, %protocol, "user started");

        while !*stop.borrow() {
            let sequence = self.sequence;
            let message = LightMessage::fetch(self.config.car_name.clone());
            let request = self.client.encode(&message, sequence);
            let request_bytes = request.body.len();

            self.transition(UserState::Requesting);
            let timestamp = Utc::now();
            let started = Instant::now();
            let exchange = {
                let attempt = self.client.exchange(request, self.config.request_timeout);
                tokio::pin!(attempt);
                let finished = tokio::select! {
                    biased;
                    exchange = &mut attempt => Some(exchange),
                    _ = stop.wait_for(|s| *s) => None,
                };
                // The stop guard is released here, before waiting out the grace period.
                match finished {
                    Some(exchange) => exchange,
                    None => match tokio::time::timeout(self.config.grace_period, &mut attempt).await {
                        Ok(exchange) => exchange,
                        Err(_) => {
                            abandoned = true;
                            Exchange {
                                request_bytes,
                                latency: started.elapsed(),
                                outcome: Err(TransportError::timeout("abandoned at shutdown")),
                            }
                        }
                    },
                }
            };

            self.transition(UserState::Recording);
            self.track_refusals(&exchange);
            let record = ResultRecord::new(protocol, self.id, sequence, timestamp, exchange);
            self.sequence += 1;
            if let Err(err) = self.collector.record(record) {
                tracing::warn!(user = self.id, "dropping result: {err}");
            }

            if abandoned || *stop.borrow() {
                break;
            }

            self.transition(UserState::ThinkTime);
            let pause = self.pause();
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = stop.wait_for(|s| *s) => break,
            }
        }

        self.transition(UserState::Stopped);
        tracing::debug!(user = self.id, %protocol, attempts = self.sequence, "user stopped");
        UserSummary {
            id: self.id,
            protocol,
            attempts: self.sequence,
            abandoned,
        }
    }

    fn track_refusals(&mut self, exchange: &Exchange) {
        match &exchange.outcome {
            Err(err) if err.kind == TransportErrorKind::ConnectionRefused => {
                self.consecutive_refusals = self.consecutive_refusals.saturating_add(1);
            }
            // Anything that reached a server resets the back-off.
            _ => self.consecutive_refusals = 0,
        }
    }

    fn pause(&self) -> Duration {
        let think = self.config.think_time.sample();
        if self.consecutive_refusals == 0 {
            return think;
        }
        let factor = backoff_factor(self.consecutive_refusals, self.config.max_backoff);
        think.max(MIN_BACKOFF_PAUSE).saturating_mul(factor)
    }
}

/// `2^refusals`, capped at `max` (and never below 1).
pub fn backoff_factor(refusals: u32, max: u32) -> u32 {
    let max = max.max(1);
    if refusals >= 32 {
        return max;
    }
    (1u32 << refusals).min(max)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    };

    use tokio::sync::watch;

    use super::*;
    use crate::{
        config::ThinkTime,
        metric::Outcome,
        protocol::{Request, Response},
    };

    struct SlowClient {
        latency: Duration,
        calls: Arc<AtomicU64>,
    }

    impl ProtocolClient for SlowClient {
        fn protocol(&self) -> Protocol {
            Protocol::Coap
        }

        fn encode(&self, message: &LightMessage, id: u64) -> Request {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Request {
                id,
                body: message.car_name.as_bytes().to_vec(),
            }
        }

        async fn send(&self, _: Request) -> Result<Response, TransportError> {
            tokio::time::sleep(self.latency).await;
            Ok(Response {
                bytes: 32,
                message: LightMessage::fetch("roadrunner"),
            })
        }
    }

    /// Refuses every attempt whose sequence is below `refuse_below`, then answers at once.
    struct RefusingClient {
        refuse_below: u64,
        calls: Arc<Mutex<Vec<Instant>>>,
    }

    impl ProtocolClient for RefusingClient {
        fn protocol(&self) -> Protocol {
            Protocol::Coap
        }

        fn encode(&self, message: &LightMessage, id: u64) -> Request {
            self.calls.lock().unwrap().push(Instant::now());
            Request {
                id,
                body: message.car_name.as_bytes().to_vec(),
            }
        }

        async fn send(&self, request: Request) -> Result<Response, TransportError> {
            if request.id < self.refuse_below {
                return Err(TransportError::refused("connection refused"));
            }
            Ok(Response {
                bytes: 32,
                message: LightMessage::fetch("roadrunner"),
            })
        }
    }

    async fn run_refusing(refuse_below: u64, window: Duration) -> Vec<Instant> {
        let config = RunConfig::builder()
            .think_time(ThinkTime::fixed(Duration::from_millis(10)))
            .max_backoff(8)
            .build();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let client = RefusingClient {
            refuse_below,
            calls: calls.clone(),
        };
        let collector = Arc::new(MetricsCollector::new([Protocol::Coap]));
        let user = VirtualUser::new(0, client, Arc::new(config), collector);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(user.run(rx));
        tokio::time::sleep(window).await;
        tx.send_replace(true);
        handle.await.unwrap();

        let calls = calls.lock().unwrap().clone();
        calls
    }

    fn gaps(calls: &[Instant]) -> Vec<Duration> {
        calls.windows(2).map(|w| w[1] - w[0]).collect()
    }

    fn setup(
        latency: Duration,
        config: RunConfig,
    ) -> (VirtualUser<SlowClient>, Arc<AtomicU64>, Arc<MetricsCollector>) {
        let calls = Arc::new(AtomicU64::new(0));
        let collector = Arc::new(MetricsCollector::new([Protocol::Coap]));
        let user = VirtualUser::new(
            7,
            SlowClient {
                latency,
                calls: calls.clone(),
            },
            Arc::new(config),
            collector.clone(),
        );
        (user, calls, collector)
    }

    #[tokio::test(start_paused = true)]
    async fn one_record_per_attempt() {
        let config = RunConfig::builder()
            .think_time(ThinkTime::fixed(Duration::from_millis(10)))
            .build();
        let (user, calls, collector) = setup(Duration::from_millis(10), config);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(user.run(rx));
        tokio::time::sleep(Duration::from_millis(205)).await;
        tx.send_replace(true);
        let summary = handle.await.unwrap();

        let report = collector.finalize().unwrap();
        assert_eq!(summary.attempts, calls.load(Ordering::SeqCst));
        assert_eq!(report.records.len() as u64, summary.attempts);
        assert!(summary.attempts >= 10, "{}", summary.attempts);
        assert!(!summary.abandoned);
        let sequences: Vec<u64> = report.records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, (0..summary.attempts).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_attempt_finishes_within_grace() {
        let config = RunConfig::builder()
            .grace_period(Duration::from_secs(1))
            .build();
        let (user, _, collector) = setup(Duration::from_millis(300), config);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(user.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send_replace(true);
        tokio::task::yield_now().await;
        // A repeated stop during the grace period must not wait on the user.
        tx.send_replace(true);
        let summary = handle.await.unwrap();

        assert_eq!(summary.attempts, 1);
        assert!(!summary.abandoned);
        let report = collector.finalize().unwrap();
        assert_eq!(report.records[0].outcome, Outcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_outliving_grace_is_a_timeout() {
        let config = RunConfig::builder()
            .grace_period(Duration::from_millis(50))
            .request_timeout(Duration::from_secs(30))
            .build();
        let (user, _, collector) = setup(Duration::from_secs(20), config);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(user.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send_replace(true);
        let summary = handle.await.unwrap();

        assert!(summary.abandoned);
        let report = collector.finalize().unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(
            report.records[0].failure_kind(),
            Some(TransportErrorKind::Timeout)
        );
        assert!(report.records[0].latency < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_user_issues_nothing() {
        let (user, calls, collector) = setup(Duration::from_millis(1), RunConfig::default());
        let (_tx, rx) = watch::channel(true);

        let summary = user.run(rx).await;
        assert_eq!(summary.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(collector.finalize().unwrap().records.is_empty());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(backoff_factor(0, 8), 1);
        assert_eq!(backoff_factor(1, 8), 2);
        assert_eq!(backoff_factor(2, 8), 4);
        assert_eq!(backoff_factor(3, 8), 8);
        assert_eq!(backoff_factor(9, 8), 8);
        assert_eq!(backoff_factor(40, 8), 8);
        assert_eq!(backoff_factor(5, 0), 1);
    }

    #[test]
    fn run_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let (user, _, _) = setup(Duration::from_millis(1), RunConfig::default());
        let (_tx, rx) = watch::channel(false);
        let run = user.run(rx);
        assert_send(&run);
    }

    #[tokio::test(start_paused = true)]
    async fn refusals_back_off_up_to_the_cap() {
        let window = Duration::from_millis(1990);
        let refusing = run_refusing(u64::MAX, window).await;
        let answering = run_refusing(0, window).await;

        // 10ms think time: ~199 answered attempts, but pauses of 20, 40, then 80ms
        // once refusals start piling up.
        assert!(answering.len() >= 150, "{}", answering.len());
        let capped = (window.as_millis() / 80) as usize + 4;
        assert!(refusing.len() <= capped, "{} > {capped}", refusing.len());
        assert!(refusing.len() >= 20, "{}", refusing.len());

        let gaps = gaps(&refusing);
        let ms = Duration::from_millis;
        assert!(gaps[0] >= ms(20) && gaps[0] < ms(22), "{:?}", gaps[0]);
        assert!(gaps[1] >= ms(40) && gaps[1] < ms(42), "{:?}", gaps[1]);
        for gap in &gaps[2..] {
            assert!(*gap >= ms(80) && *gap < ms(82), "{gap:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn answered_attempt_resets_the_backoff() {
        let calls = run_refusing(3, Duration::from_millis(300)).await;
        let gaps = gaps(&calls);
        let ms = Duration::from_millis;

        // Three refusals (pauses of 20, 40, 80ms), then answers at the plain think time.
        assert!(gaps[2] >= ms(80) && gaps[2] < ms(82), "{:?}", gaps[2]);
        for gap in &gaps[3..] {
            assert!(*gap >= ms(10) && *gap < ms(12), "{gap:?}");
        }
        assert!(gaps.len() > 6);
    }
}
