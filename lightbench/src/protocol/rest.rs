use reqwest::{Url, header::CONTENT_TYPE};
use serde_json::json;

use super::{Protocol, ProtocolClient, Request, Response};
use crate::{
    error::TransportError,
    message::{LightMessage, YangOutput},
};

/// `POST /externalLights` with a JSON body naming the car.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    url: Url,
}

impl RestClient {
    pub fn new(http: reqwest::Client, url: Url) -> Self {
        Self { http, url }
    }
}

impl ProtocolClient for RestClient {
    fn protocol(&self) -> Protocol {
        Protocol::Rest
    }

    fn encode(&self, message: &LightMessage, id: u64) -> Request {
        let body = json!({ "carName": message.car_name });
        Request {
            id,
            body: body.to_string().into_bytes(),
        }
    }

    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let body = post_json(&self.http, &self.url, request.body).await?;
        let output: YangOutput = serde_json::from_slice(&body)
            .map_err(|e| TransportError::malformed(e.to_string(), body.len()))?;
        Ok(Response {
            bytes: body.len(),
            message: output.into(),
        })
    }
}

/// Posts a JSON body and reads the full response, rejecting non-2xx statuses.
pub(super) async fn post_json(
    http: &reqwest::Client,
    url: &Url,
    body: Vec<u8>,
) -> Result<Vec<u8>, TransportError> {
    let response = http
        .post(url.clone())
        .header(CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|e| TransportError::from_reqwest(&e))?;
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| TransportError::from_reqwest(&e))?;
    if !status.is_success() {
        return Err(TransportError::malformed(
            format!("unexpected status {status}"),
            bytes.len(),
        ));
    }
    Ok(bytes.to_vec())
}
