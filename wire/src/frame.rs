use crate::heartbeat::Heartbeat;
use prost::Message;
use std::error::Error;
use std::fmt::Display;

/// Receivers drop the connection on anything larger than this.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Length of the big endian length prefix.
pub const HEADER_LEN: usize = 4;

#[derive(Debug)]
pub enum ParseError {
    ShortHeader(usize),
    EmptyPayload,
    Oversized(usize),
    Truncated { expected: usize, got: usize },
    Malformed(prost::DecodeError),
    SchemaViolation(String),
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::ShortHeader(got) => {
                write!(f, "frame header needs {HEADER_LEN} bytes, got {}", got)
            }
            ParseError::EmptyPayload => {
                write!(f, "frame declares a zero length payload")
            }
            ParseError::Oversized(len) => {
                write!(f, "frame payload of {} bytes exceeds {MAX_PAYLOAD}", len)
            }
            ParseError::Truncated { expected, got } => {
                write!(f, "frame body truncated, expected {expected} bytes got {got}")
            }
            ParseError::Malformed(e) => {
                write!(f, "payload is not a valid heartbeat: {}", e)
            }
            ParseError::SchemaViolation(msg) => {
                write!(f, "heartbeat failed validation: {}", msg)
            }
        }
    }
}

impl Error for ParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ParseError::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

/// Builds one wire frame: 4 byte big endian payload length then the payload.
pub fn encode(hb: &Heartbeat) -> Result<Vec<u8>, ParseError> {
    let payload = hb.encode_to_vec();
    if payload.len() > MAX_PAYLOAD {
        return Err(ParseError::Oversized(payload.len()));
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parses exactly one frame (header plus body).
pub fn decode(frame: &[u8]) -> Result<Heartbeat, ParseError> {
    if frame.len() < HEADER_LEN {
        return Err(ParseError::ShortHeader(frame.len()));
    }
    let len = u32::from_be_bytes(frame[..HEADER_LEN].try_into().unwrap()) as usize;
    if len == 0 {
        return Err(ParseError::EmptyPayload);
    }
    if len > MAX_PAYLOAD {
        return Err(ParseError::Oversized(len));
    }
    if frame.len() < HEADER_LEN + len {
        return Err(ParseError::Truncated {
            expected: len,
            got: frame.len() - HEADER_LEN,
        });
    }
    decode_payload(&frame[HEADER_LEN..HEADER_LEN + len])
}

/// Parses a frame body that has already been cut out of the stream.
pub fn decode_payload(payload: &[u8]) -> Result<Heartbeat, ParseError> {
    let hb = Heartbeat::decode(payload).map_err(ParseError::Malformed)?;
    hb.validate().map_err(ParseError::SchemaViolation)?;
    Ok(hb)
}

/// Reassembles frames from an arbitrarily partitioned byte stream.
///
/// Feed whatever the socket produced, then pull complete payloads until
/// `Ok(None)`. Framing errors are not recoverable, the caller is expected to
/// retire the connection.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ParseError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.buf[..HEADER_LEN].try_into().unwrap()) as usize;
        if len == 0 {
            return Err(ParseError::EmptyPayload);
        }
        if len > MAX_PAYLOAD {
            return Err(ParseError::Oversized(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let mut frame: Vec<u8> = self.buf.drain(..HEADER_LEN + len).collect();
        frame.drain(..HEADER_LEN);
        Ok(Some(frame))
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
