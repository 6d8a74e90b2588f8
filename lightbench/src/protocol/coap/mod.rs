//! CoAP FETCH over UDP with a CBOR (CORECONF) response.
pub mod codec;
pub mod coreconf;

use tokio::{net::UdpSocket, sync::OnceCell};

use self::codec::{Code, Message, MessageType, content_format, option};
use super::{Protocol, ProtocolClient, Request, Response};
use crate::{error::TransportError, message::LightMessage};

/// Large enough for any response the status resource produces.
const RECV_BUFFER: usize = 2048;

/// One UDP "connection" per client, bound lazily on the first request.
///
/// Sizes are whole datagrams (header, options and payload): CoAP has no framing
/// below the message.
pub struct CoapClient {
    host: String,
    port: u16,
    path: String,
    socket: OnceCell<UdpSocket>,
}

impl CoapClient {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            socket: OnceCell::new(),
        }
    }

    async fn socket(&self) -> Result<&UdpSocket, TransportError> {
        self.socket
            .get_or_try_init(|| async {
                let addr = tokio::net::lookup_host((self.host.as_str(), self.port))
                    .await
                    .map_err(|e| TransportError::refused(format!("resolve {}: {e}", self.host)))?
                    .next()
                    .ok_or_else(|| TransportError::refused(format!("no address for {}", self.host)))?;
                let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(local)
                    .await
                    .map_err(|e| TransportError::from_io(&e))?;
                socket
                    .connect(addr)
                    .await
                    .map_err(|e| TransportError::from_io(&e))?;
                tracing::debug!("coap socket {:?} connected to {addr}", socket.local_addr());
                Ok::<_, TransportError>(socket)
            })
            .await
    }
}

pub fn message_id(id: u64) -> u16 {
    id as u16
}

pub fn token(id: u64) -> [u8; 4] {
    (id as u32).to_be_bytes()
}

impl ProtocolClient for CoapClient {
    fn protocol(&self) -> Protocol {
        Protocol::Coap
    }

    fn encode(&self, message: &LightMessage, id: u64) -> Request {
        let mut request = Message::request(Code::FETCH, message_id(id), &token(id), &self.path);
        request.push_uint_option(
            option::CONTENT_FORMAT,
            u32::from(content_format::TEXT_PLAIN),
        );
        request.payload = message.car_name.as_bytes().to_vec();
        Request {
            id,
            body: request.encode(),
        }
    }

    async fn send(&self, request: Request) -> Result<Response, TransportError> {
        let socket = self.socket().await?;
        let mid = message_id(request.id);
        let token = token(request.id);
        socket
            .send(&request.body)
            .await
            .map_err(|e| TransportError::from_io(&e))?;

        let mut buf = [0u8; RECV_BUFFER];
        loop {
            let n = socket
                .recv(&mut buf)
                .await
                .map_err(|e| TransportError::from_io(&e))?;
            let reply = Message::decode(&buf[..n])
                .map_err(|e| TransportError::malformed(e.to_string(), n))?;

            match reply.kind {
                MessageType::Reset if reply.message_id == mid => {
                    return Err(TransportError::refused("reset by server"));
                }
                MessageType::Acknowledgement if reply.message_id == mid => {
                    if reply.code == Code::EMPTY {
                        // Separate response follows in its own message.
                        continue;
                    }
                    if reply.token != token {
                        return Err(TransportError::malformed("token mismatch", n));
                    }
                    return finish(&reply, n);
                }
                MessageType::Confirmable | MessageType::NonConfirmable if reply.token == token => {
                    if reply.kind == MessageType::Confirmable {
                        socket
                            .send(&Message::empty_ack(reply.message_id).encode())
                            .await
                            .map_err(|e| TransportError::from_io(&e))?;
                    }
                    return finish(&reply, n);
                }
                _ => {
                    tracing::trace!(
                        "ignoring stray coap message {} (mid {})",
                        reply.code,
                        reply.message_id
                    );
                }
            }
        }
    }
}

fn finish(reply: &Message, bytes: usize) -> Result<Response, TransportError> {
    if !reply.code.is_success() {
        return Err(TransportError::malformed(
            format!("response code {}", reply.code),
            bytes,
        ));
    }
    let message = coreconf::decode_status(&reply.payload)
        .map_err(|reason| TransportError::malformed(reason, bytes))?;
    Ok(Response { bytes, message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CAR_NAME, ExteriorLight};

    #[test]
    fn request_is_a_confirmable_fetch() {
        let client = CoapClient::new("localhost", 5683, "60001");
        let request = client.encode(&LightMessage::fetch(CAR_NAME), 0x1_0002);
        let message = Message::decode(&request.body).unwrap();

        assert_eq!(message.kind, MessageType::Confirmable);
        assert_eq!(message.code, Code::FETCH);
        assert_eq!(message.message_id, 2);
        assert_eq!(message.token, vec![0, 1, 0, 2]);
        assert_eq!(message.path(), "60001");
        assert_eq!(message.payload, CAR_NAME.as_bytes());
    }

    #[test]
    fn error_codes_are_malformed_responses() {
        let mut reply = Message::new(MessageType::Acknowledgement, Code::NOT_FOUND, 1);
        reply.payload = b"nope".to_vec();
        let err = finish(&reply, 9).unwrap_err();
        assert_eq!(err.kind, crate::error::TransportErrorKind::MalformedResponse);
        assert_eq!(err.response_bytes, 9);
    }

    #[test]
    fn content_is_decoded() {
        let status = LightMessage::with_state(CAR_NAME, ExteriorLight::ParkingLightsOn);
        let mut reply = Message::new(MessageType::Acknowledgement, Code::CONTENT, 1);
        reply.payload = coreconf::encode_status(&status).unwrap();
        let response = finish(&reply, 40).unwrap();
        assert_eq!(response.message, status);
        assert_eq!(response.bytes, 40);
    }
}
