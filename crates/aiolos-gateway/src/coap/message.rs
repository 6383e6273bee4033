//! CoAP message encoding and decoding.
//!
//! # Wire Format (RFC 7252 Section 3)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::{OPTION_CONTENT_FORMAT, OPTION_URI_PATH};

/// Protocol version carried in every message.
const COAP_VERSION: u8 = 1;
/// Fixed header size in bytes.
const HEADER_SIZE: usize = 4;
/// Separates options from the payload.
const PAYLOAD_MARKER: u8 = 0xFF;
/// Longest token a message may carry.
const MAX_TOKEN_LEN: usize = 8;

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoapError {
    #[error("message shorter than the 4-byte header ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),
    #[error("token length {0} exceeds 8 bytes")]
    InvalidTokenLength(u8),
    #[error("message truncated")]
    Truncated,
    #[error("reserved option nibble 15")]
    ReservedOptionNibble,
    #[error("option number overflows u16")]
    OptionNumberOverflow,
    #[error("payload marker followed by empty payload")]
    EmptyPayload,
    #[error("empty message carries a token, options or payload")]
    MalformedEmpty,
    #[error("option value too long ({0} bytes)")]
    OptionTooLong(usize),
    #[error("Uri-Path segment is empty, contains '/' or is not UTF-8")]
    InvalidUriPath,
}

/// Message type from the header's `T` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    fn bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }
}

/// Request method or response code, packed as `class << 5 | detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

impl Code {
    pub const EMPTY: Code = Code::new(0, 0);
    pub const GET: Code = Code::new(0, 1);
    pub const POST: Code = Code::new(0, 2);
    pub const PUT: Code = Code::new(0, 3);
    pub const DELETE: Code = Code::new(0, 4);

    pub const CHANGED: Code = Code::new(2, 4);
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);
    pub const BAD_GATEWAY: Code = Code::new(5, 2);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code(((class & 0x07) << 5) | (detail & 0x1F))
    }

    pub const fn from_raw(raw: u8) -> Self {
        Code(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    pub const fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// Class 0 with a non-zero detail.
    pub const fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Method name for request codes, used in logs.
    pub fn method_name(self) -> Option<&'static str> {
        match self {
            Code::GET => Some("GET"),
            Code::POST => Some("POST"),
            Code::PUT => Some("PUT"),
            Code::DELETE => Some("DELETE"),
            _ => None,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// A single option instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Bytes,
}

/// A decoded CoAP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub mtype: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Bytes,
    pub options: Vec<CoapOption>,
    pub payload: Bytes,
}

impl Message {
    /// Build a message with no options and no payload.
    pub fn new(mtype: MessageType, code: Code, message_id: u16, token: Bytes) -> Self {
        Self {
            mtype,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// A Reset answering `message_id`.
    pub fn reset(message_id: u16) -> Self {
        Self::new(MessageType::Reset, Code::EMPTY, message_id, Bytes::new())
    }

    /// Read just the type and message id from a datagram whose body failed to
    /// decode, so a Confirmable sender can still be told to stop.
    pub fn peek_header(buf: &[u8]) -> Option<(MessageType, u16)> {
        if buf.len() < HEADER_SIZE || buf[0] >> 6 != COAP_VERSION {
            return None;
        }
        Some((
            MessageType::from_bits(buf[0] >> 4),
            u16::from_be_bytes([buf[2], buf[3]]),
        ))
    }

    pub fn add_option(&mut self, number: u16, value: impl Into<Bytes>) {
        self.options.push(CoapOption {
            number,
            value: value.into(),
        });
    }

    /// Values of every instance of `number`, in message order.
    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &Bytes> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| &o.value)
    }

    /// The request path assembled from Uri-Path options, always starting with `/`.
    ///
    /// Each option is exactly one segment, so a value that is empty, holds a
    /// `/` or is not valid UTF-8 cannot be expressed as a path and is rejected.
    pub fn uri_path(&self) -> Result<String, CoapError> {
        let mut path = String::new();
        for segment in self.option_values(OPTION_URI_PATH) {
            let segment = std::str::from_utf8(segment).map_err(|_| CoapError::InvalidUriPath)?;
            if segment.is_empty() || segment.contains('/') {
                return Err(CoapError::InvalidUriPath);
            }
            path.push('/');
            path.push_str(segment);
        }
        if path.is_empty() {
            path.push('/');
        }
        Ok(path)
    }

    /// Build the response to this request.
    ///
    /// A Confirmable request gets a piggy-backed Acknowledgement with the same
    /// message id. Anything else gets a Non-confirmable response carrying
    /// `fresh_id`. The token is always echoed.
    pub fn response(&self, code: Code, body: &str, fresh_id: u16) -> Message {
        let (mtype, message_id) = match self.mtype {
            MessageType::Confirmable => (MessageType::Acknowledgement, self.message_id),
            _ => (MessageType::NonConfirmable, fresh_id),
        };
        let mut response = Message::new(mtype, code, message_id, self.token.clone());
        if !body.is_empty() {
            // text/plain is Content-Format 0, which encodes as a zero-length uint.
            response.add_option(OPTION_CONTENT_FORMAT, Bytes::new());
            response.payload = Bytes::copy_from_slice(body.as_bytes());
        }
        response
    }

    /// Decode a datagram.
    pub fn decode(buf: &[u8]) -> Result<Self, CoapError> {
        if buf.len() < HEADER_SIZE {
            return Err(CoapError::TooShort(buf.len()));
        }

        let version = buf[0] >> 6;
        if version != COAP_VERSION {
            return Err(CoapError::BadVersion(version));
        }
        let mtype = MessageType::from_bits(buf[0] >> 4);
        let token_len = buf[0] & 0x0F;
        if token_len as usize > MAX_TOKEN_LEN {
            return Err(CoapError::InvalidTokenLength(token_len));
        }
        let code = Code::from_raw(buf[1]);
        let message_id = u16::from_be_bytes([buf[2], buf[3]]);

        if code.is_empty() && (token_len != 0 || buf.len() > HEADER_SIZE) {
            return Err(CoapError::MalformedEmpty);
        }

        let token_end = HEADER_SIZE + token_len as usize;
        if buf.len() < token_end {
            return Err(CoapError::Truncated);
        }
        let token = Bytes::copy_from_slice(&buf[HEADER_SIZE..token_end]);

        let mut options = Vec::new();
        let mut payload = Bytes::new();
        let mut pos = token_end;
        let mut number: u32 = 0;

        while pos < buf.len() {
            let byte = buf[pos];
            pos += 1;

            if byte == PAYLOAD_MARKER {
                if pos == buf.len() {
                    return Err(CoapError::EmptyPayload);
                }
                payload = Bytes::copy_from_slice(&buf[pos..]);
                break;
            }

            let delta = read_extended(byte >> 4, buf, &mut pos)?;
            let length = read_extended(byte & 0x0F, buf, &mut pos)? as usize;

            number = number
                .checked_add(delta)
                .ok_or(CoapError::OptionNumberOverflow)?;
            let option_number =
                u16::try_from(number).map_err(|_| CoapError::OptionNumberOverflow)?;

            let end = pos.checked_add(length).ok_or(CoapError::Truncated)?;
            if end > buf.len() {
                return Err(CoapError::Truncated);
            }
            options.push(CoapOption {
                number: option_number,
                value: Bytes::copy_from_slice(&buf[pos..end]),
            });
            pos = end;
        }

        Ok(Self {
            mtype,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }

    /// Encode to wire format. Options are emitted in ascending number order.
    pub fn encode(&self) -> Result<Bytes, CoapError> {
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(CoapError::InvalidTokenLength(self.token.len() as u8));
        }

        let mut buf = BytesMut::with_capacity(
            HEADER_SIZE + self.token.len() + self.payload.len() + 1 + self.options.len() * 4,
        );
        buf.put_u8((COAP_VERSION << 6) | (self.mtype.bits() << 4) | self.token.len() as u8);
        buf.put_u8(self.code.raw());
        buf.put_u16(self.message_id);
        buf.put_slice(&self.token);

        let mut sorted: Vec<&CoapOption> = self.options.iter().collect();
        sorted.sort_by_key(|o| o.number);

        let mut previous: u16 = 0;
        for option in sorted {
            let delta = u32::from(option.number - previous);
            let length = option.value.len();
            if length > u16::MAX as usize + 269 {
                return Err(CoapError::OptionTooLong(length));
            }
            let (delta_nibble, delta_ext) = split_extended(delta);
            let (length_nibble, length_ext) = split_extended(length as u32);

            buf.put_u8((delta_nibble << 4) | length_nibble);
            put_extended(&mut buf, delta_nibble, delta_ext);
            put_extended(&mut buf, length_nibble, length_ext);
            buf.put_slice(&option.value);
            previous = option.number;
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }

        Ok(buf.freeze())
    }
}

/// Resolve a 4-bit delta/length nibble, consuming extended bytes when needed.
fn read_extended(nibble: u8, buf: &[u8], pos: &mut usize) -> Result<u32, CoapError> {
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let b = *buf.get(*pos).ok_or(CoapError::Truncated)?;
            *pos += 1;
            Ok(u32::from(b) + 13)
        }
        14 => {
            if *pos + 2 > buf.len() {
                return Err(CoapError::Truncated);
            }
            let v = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]);
            *pos += 2;
            Ok(u32::from(v) + 269)
        }
        _ => Err(CoapError::ReservedOptionNibble),
    }
}

fn split_extended(value: u32) -> (u8, u32) {
    match value {
        0..=12 => (value as u8, 0),
        13..=268 => (13, value - 13),
        _ => (14, value - 269),
    }
}

fn put_extended(buf: &mut BytesMut, nibble: u8, ext: u32) {
    match nibble {
        13 => buf.put_u8(ext as u8),
        14 => buf.put_u16(ext as u16),
        _ => {}
    }
}
