//! Protocol clients: one encode/send/decode adapter per wire protocol.
//!
//! Every adapter implements [`ProtocolClient`]. The set of adapters is closed and
//! selected by configuration through [`Client`]; the scheduler never sees which
//! transport is behind a virtual user beyond its [`Protocol`] tag.
//!
//! Clients do not retry. A single call to [`ProtocolClient::exchange`] is a single
//! attempt, so the size and latency it reports always belong to that attempt.
pub mod coap;
pub mod jsonrpc;
pub mod rest;

pub use coap::CoapClient;
pub use jsonrpc::JsonRpcClient;
pub use rest::RestClient;

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, future::Future, time::Duration};
use tokio::time::Instant;

use crate::{
    config::{EndpointConfig, RunConfig},
    error::{ConfigError, TransportError},
    message::LightMessage,
};

/// Tag naming the protocol a client, user or record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "REST")]
    Rest,
    #[serde(rename = "COAP")]
    Coap,
    #[serde(rename = "JSONRPC")]
    JsonRpc,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Rest, Protocol::Coap, Protocol::JsonRpc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rest => "REST",
            Protocol::Coap => "COAP",
            Protocol::JsonRpc => "JSONRPC",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request already encoded into its wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation id the response must echo (JSON-RPC id, CoAP message id/token).
    pub id: u64,
    pub body: Vec<u8>,
}

/// A decoded response and the number of raw bytes it took on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub bytes: usize,
    pub message: LightMessage,
}

/// Everything observed about one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub request_bytes: usize,
    pub latency: Duration,
    pub outcome: Result<Response, TransportError>,
}

impl Exchange {
    pub fn response_bytes(&self) -> usize {
        match &self.outcome {
            Ok(response) => response.bytes,
            Err(err) => err.response_bytes,
        }
    }
}

/// Capability shared by all protocol adapters.
pub trait ProtocolClient: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    /// Encodes `message` into the exact bytes [`ProtocolClient::send`] will transmit.
    fn encode(&self, message: &LightMessage, id: u64) -> Request;

    /// Transmits an encoded request and decodes the answer.
    ///
    /// Must not panic on any server input; every problem is a [`TransportError`].
    fn send(&self, request: Request) -> impl Future<Output = Result<Response, TransportError>> + Send;

    /// Sends and times a single attempt, bounded by `timeout`.
    fn exchange(&self, request: Request, timeout: Duration) -> impl Future<Output = Exchange> + Send {
        let request_bytes = request.body.len();
        async move {
            let start = Instant::now();
            let outcome = match tokio::time::timeout(timeout, self.send(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::timeout(format!(
                    "no response within {}ms",
                    timeout.as_millis()
                ))),
            };
            Exchange {
                request_bytes,
                latency: start.elapsed(),
                outcome,
            }
        }
    }
}

/// The closed set of real protocol adapters.
pub enum Client {
    Rest(RestClient),
    Coap(CoapClient),
    JsonRpc(JsonRpcClient),
    /// A protocol with no configured endpoint; every attempt is refused.
    Unavailable(Protocol),
}

impl ProtocolClient for Client {
    fn protocol(&self) -> Protocol {
        match self {
            Client::Rest(_) => Protocol::Rest,
            Client::Coap(_) => Protocol::Coap,
            Client::JsonRpc(_) => Protocol::JsonRpc,
            Client::Unavailable(protocol) => *protocol,
        }
    }

    fn encode(&self, message: &LightMessage, id: u64) -> Request {
        match self {
            Client::Rest(c) => c.encode(message, id),
            Client::Coap(c) => c.encode(message, id),
            Client::JsonRpc(c) => c.encode(message, id),
            Client::Unavailable(_) => Request { id, body: vec![] },
        }
    }

    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        match self {
            Client::Rest(c) => c.send(request).await,
            Client::Coap(c) => c.send(request).await,
            Client::JsonRpc(c) => c.send(request).await,
            Client::Unavailable(protocol) => Err(TransportError::refused(format!(
                "no {protocol} endpoint configured"
            ))),
        }
    }
}

/// Builds the client a freshly spawned virtual user will own.
pub trait ClientFactory: Send + Sync + 'static {
    type Client: ProtocolClient;

    fn connect(&self, protocol: Protocol) -> Self::Client;
}

impl<C, F> ClientFactory for F
where
    C: ProtocolClient,
    F: Fn(Protocol) -> C + Send + Sync + 'static,
{
    type Client = C;

    fn connect(&self, protocol: Protocol) -> C {
        self(protocol)
    }
}

/// Factory for the real servers described by a [`RunConfig`].
///
/// HTTP-based users share one pooled `reqwest` client; every CoAP user gets its own
/// UDP socket.
pub struct EndpointFactory {
    http: reqwest::Client,
    endpoints: HashMap<Protocol, EndpointConfig>,
}

impl EndpointFactory {
    pub fn new(config: &RunConfig) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            http,
            endpoints: config.endpoints()?.into_iter().collect(),
        })
    }
}

impl ClientFactory for EndpointFactory {
    type Client = Client;

    fn connect(&self, protocol: Protocol) -> Client {
        match (protocol, self.endpoints.get(&protocol)) {
            (Protocol::Coap, Some(EndpointConfig::Coap { host, port, path })) => {
                Client::Coap(CoapClient::new(host.clone(), *port, path.clone()))
            }
            (Protocol::Rest, Some(EndpointConfig::Http { url })) => {
                Client::Rest(RestClient::new(self.http.clone(), url.clone()))
            }
            (Protocol::JsonRpc, Some(EndpointConfig::Http { url })) => {
                Client::JsonRpc(JsonRpcClient::new(self.http.clone(), url.clone()))
            }
            _ => Client::Unavailable(protocol),
        }
    }
}
