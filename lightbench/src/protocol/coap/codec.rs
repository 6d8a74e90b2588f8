//! Minimal CoAP (RFC 7252) message codec: header, token, options and payload.
//!
//! Only what a FETCH client needs is modelled. Option values stay opaque bytes.
use thiserror::Error;

pub const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xff;
const HEADER_LEN: usize = 4;
const MAX_TOKEN_LEN: usize = 8;

pub mod option {
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
}

pub mod content_format {
    pub const TEXT_PLAIN: u16 = 0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

/// Request method or response code, `class.detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);
    /// RFC 8132
    pub const FETCH: Code = Code::new(0, 5);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const NOT_FOUND: Code = Code::new(4, 4);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1f))
    }

    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(self) -> u8 {
        self.0 & 0x1f
    }

    pub fn is_success(self) -> bool {
        self.class() == 2
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("datagram shorter than a coap header ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported coap version {0}")]
    Version(u8),
    #[error("invalid token length {0}")]
    TokenLength(u8),
    #[error("datagram truncated inside {0}")]
    Truncated(&'static str),
    #[error("option number {0} out of range")]
    OptionNumber(u32),
    #[error("reserved option nibble 15")]
    ReservedNibble,
    #[error("payload marker followed by an empty payload")]
    EmptyPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Vec<u8>,
    /// `(number, value)` pairs; encoding sorts them by number.
    pub options: Vec<(u16, Vec<u8>)>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            kind,
            code,
            message_id,
            token: vec![],
            options: vec![],
            payload: vec![],
        }
    }

    /// Confirmable request for `path` (slash separated, one Uri-Path option per segment).
    pub fn request(code: Code, message_id: u16, token: &[u8], path: &str) -> Self {
        let mut message = Self::new(MessageType::Confirmable, code, message_id);
        message.token = token.to_vec();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            message.push_option(option::URI_PATH, segment.as_bytes().to_vec());
        }
        message
    }

    pub fn empty_ack(message_id: u16) -> Self {
        Self::new(MessageType::Acknowledgement, Code::EMPTY, message_id)
    }

    pub fn push_option(&mut self, number: u16, value: Vec<u8>) {
        self.options.push((number, value));
    }

    pub fn push_uint_option(&mut self, number: u16, value: u32) {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        self.push_option(number, bytes[skip..].to_vec());
    }

    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, v)| v.as_slice())
    }

    pub fn path(&self) -> String {
        self.options
            .iter()
            .filter(|(n, _)| *n == option::URI_PATH)
            .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn encode(&self) -> Vec<u8> {
        let token_len = self.token.len().min(MAX_TOKEN_LEN);
        let mut out = Vec::with_capacity(HEADER_LEN + token_len + self.payload.len() + 16);
        out.push((VERSION << 6) | (self.kind.bits() << 4) | token_len as u8);
        out.push(self.code.0);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token[..token_len]);

        let mut options: Vec<&(u16, Vec<u8>)> = self.options.iter().collect();
        options.sort_by_key(|(n, _)| *n);
        let mut previous = 0u16;
        for (number, value) in options {
            let (delta_nibble, delta_ext) = split_nibble(u32::from(*number - previous));
            let (len_nibble, len_ext) = split_nibble(value.len() as u32);
            out.push((delta_nibble << 4) | len_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&len_ext);
            out.extend_from_slice(value);
            previous = *number;
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&self.payload);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_LEN {
            return Err(CodecError::TooShort(buf.len()));
        }
        let version = buf[0] >> 6;
        if version != VERSION {
            return Err(CodecError::Version(version));
        }
        let token_len = buf[0] & 0x0f;
        if usize::from(token_len) > MAX_TOKEN_LEN {
            return Err(CodecError::TokenLength(token_len));
        }
        let mut message = Self::new(
            MessageType::from_bits(buf[0] >> 4),
            Code(buf[1]),
            u16::from_be_bytes([buf[2], buf[3]]),
        );

        let mut pos = HEADER_LEN;
        let token_end = pos + usize::from(token_len);
        message.token = buf
            .get(pos..token_end)
            .ok_or(CodecError::Truncated("token"))?
            .to_vec();
        pos = token_end;

        let mut number = 0u32;
        while pos < buf.len() {
            let byte = buf[pos];
            pos += 1;
            if byte == PAYLOAD_MARKER {
                if pos == buf.len() {
                    return Err(CodecError::EmptyPayload);
                }
                message.payload = buf[pos..].to_vec();
                break;
            }
            let delta = read_extended(byte >> 4, buf, &mut pos)?;
            let len = read_extended(byte & 0x0f, buf, &mut pos)? as usize;
            number += delta;
            let value = buf
                .get(pos..pos + len)
                .ok_or(CodecError::Truncated("option value"))?;
            pos += len;
            let option_number =
                u16::try_from(number).map_err(|_| CodecError::OptionNumber(number))?;
            message.options.push((option_number, value.to_vec()));
        }
        Ok(message)
    }
}

/// Splits an option delta or length into its 4-bit nibble and extended bytes.
fn split_nibble(value: u32) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, vec![]),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (14, ((value - 269) as u16).to_be_bytes().to_vec()),
    }
}

fn read_extended(nibble: u8, buf: &[u8], pos: &mut usize) -> Result<u32, CodecError> {
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let b = *buf.get(*pos).ok_or(CodecError::Truncated("option header"))?;
            *pos += 1;
            Ok(u32::from(b) + 13)
        }
        14 => {
            let b = buf
                .get(*pos..*pos + 2)
                .ok_or(CodecError::Truncated("option header"))?;
            *pos += 2;
            Ok(u32::from(u16::from_be_bytes([b[0], b[1]])) + 269)
        }
        _ => Err(CodecError::ReservedNibble),
    }
}
