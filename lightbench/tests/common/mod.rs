#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use lightbench::{
    Protocol, ProtocolClient, RunConfig, ThinkTime,
    error::TransportError,
    message::{ExteriorLight, LightMessage},
    protocol::{Request, Response},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Respond,
    Refuse,
    /// Never answers.
    Hang,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub connects: AtomicUsize,
    pub calls: AtomicU64,
}

/// In-memory server stand-in: fixed latency, fixed sizes.
pub struct FakeClient {
    protocol: Protocol,
    behavior: Behavior,
    latency: Duration,
    counters: Arc<Counters>,
}

pub const REQUEST_BYTES: usize = 24;
pub const RESPONSE_BYTES: usize = 64;

impl ProtocolClient for FakeClient {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn encode(&self, _: &LightMessage, id: u64) -> Request {
        self.counters.calls.fetch_add(1, Ordering::SeqCst);
        Request {
            id,
            body: vec![0; REQUEST_BYTES],
        }
    }

    async fn send(&self, _: Request) -> Result<Response, TransportError> {
        match self.behavior {
            Behavior::Respond => {
                tokio::time::sleep(self.latency).await;
                Ok(Response {
                    bytes: RESPONSE_BYTES,
                    message: LightMessage::with_state("roadrunner", ExteriorLight::FogLightOn),
                })
            }
            Behavior::Refuse => Err(TransportError::refused("connection refused")),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

pub struct FakeFactory {
    latency: Duration,
    behaviors: BTreeMap<Protocol, Behavior>,
    counters: BTreeMap<Protocol, Arc<Counters>>,
}

impl FakeFactory {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            behaviors: BTreeMap::new(),
            counters: Protocol::ALL
                .into_iter()
                .map(|p| (p, Arc::new(Counters::default())))
                .collect(),
        }
    }

    pub fn with(mut self, protocol: Protocol, behavior: Behavior) -> Self {
        self.behaviors.insert(protocol, behavior);
        self
    }

    pub fn all(mut self, behavior: Behavior) -> Self {
        for p in Protocol::ALL {
            self.behaviors.insert(p, behavior);
        }
        self
    }

    pub fn counters(&self) -> BTreeMap<Protocol, Arc<Counters>> {
        self.counters.clone()
    }
}

impl lightbench::ClientFactory for FakeFactory {
    type Client = FakeClient;

    fn connect(&self, protocol: Protocol) -> FakeClient {
        let counters = self.counters[&protocol].clone();
        counters.connects.fetch_add(1, Ordering::SeqCst);
        FakeClient {
            protocol,
            behavior: self
                .behaviors
                .get(&protocol)
                .copied()
                .unwrap_or(Behavior::Respond),
            latency: self.latency,
            counters,
        }
    }
}

pub fn config(users: usize, spawn_rate: f64, duration: Duration) -> RunConfig {
    RunConfig::builder()
        .users_per_protocol(users)
        .spawn_rate(spawn_rate)
        .duration(duration)
        .think_time(ThinkTime::fixed(Duration::from_millis(10)))
        .grace_period(Duration::from_millis(500))
        .build()
}
