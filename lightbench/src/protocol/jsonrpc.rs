use reqwest::Url;
use serde::Deserialize;
use serde_json::json;

use super::{Protocol, ProtocolClient, Request, Response, rest::post_json};
use crate::{
    error::TransportError,
    message::{LightMessage, YangOutput},
};

pub const FETCH_METHOD: &str = "fetch";

/// JSON-RPC 2.0 over HTTP: `{"jsonrpc": "2.0", "method": "fetch", "params": [car], "id": n}`.
#[derive(Clone)]
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: Url,
}

impl JsonRpcClient {
    pub fn new(http: reqwest::Client, url: Url) -> Self {
        Self { http, url }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<YangOutput>,
    #[serde(default)]
    error: Option<RpcError>,
    #[serde(default)]
    id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl ProtocolClient for JsonRpcClient {
    fn protocol(&self) -> Protocol {
        Protocol::JsonRpc
    }

    fn encode(&self, message: &LightMessage, id: u64) -> Request {
        let body = json!({
            "jsonrpc": "2.0",
            "method": FETCH_METHOD,
            "params": [message.car_name],
            "id": id,
        });
        Request {
            id,
            body: body.to_string().into_bytes(),
        }
    }

    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let body = post_json(&self.http, &self.url, request.body).await?;
        let bytes = body.len();
        let envelope: Envelope = serde_json::from_slice(&body)
            .map_err(|e| TransportError::malformed(e.to_string(), bytes))?;

        if let Some(err) = envelope.error {
            return Err(TransportError::malformed(
                format!("rpc error {}: {}", err.code, err.message),
                bytes,
            ));
        }
        if envelope.id.as_ref().and_then(|v| v.as_u64()) != Some(request.id) {
            return Err(TransportError::malformed(
                format!("response id {:?} does not match {}", envelope.id, request.id),
                bytes,
            ));
        }
        let output = envelope
            .result
            .ok_or_else(|| TransportError::malformed("response carries no result", bytes))?;
        Ok(Response {
            bytes,
            message: output.into(),
        })
    }
}
