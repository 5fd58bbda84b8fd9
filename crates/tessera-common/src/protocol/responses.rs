//! Tessera Response Types
//!
//! This module defines what a completed request hands back to the engine: a
//! decoded response, or a server error decoded from an ERROR frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{ProtocolError, ServerErrorKind};
use super::frame::Opcode;

/// A successful response as produced by the payload codec.
///
/// # Fields
///
/// - `opcode`: The opcode of the frame that carried the response
/// - `body`: The codec's decoded body, opaque to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    pub body: Bytes,
}

impl Response {
    pub fn new(opcode: Opcode, body: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            body: body.into(),
        }
    }

    /// The empty result used when a failed write is ignored.
    pub fn empty() -> Self {
        Self::new(Opcode::Result, Bytes::new())
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// The envelope of an ERROR frame: `[i32 code][u16 length][utf8 message]`.
///
/// Only the envelope is decoded; kind-specific trailing fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub message: String,
}

impl ServerError {
    pub fn new(kind: ServerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn decode(mut body: &[u8]) -> Result<Self, ProtocolError> {
        if body.remaining() < 6 {
            return Err(ProtocolError::Malformed(format!(
                "ERROR body too short: {} bytes",
                body.len()
            )));
        }
        let code = body.get_i32();
        let len = body.get_u16() as usize;
        if body.remaining() < len {
            return Err(ProtocolError::Malformed(format!(
                "ERROR message announces {} bytes, {} available",
                len,
                body.remaining()
            )));
        }
        let message = std::str::from_utf8(&body[..len])
            .map_err(|e| ProtocolError::Malformed(format!("ERROR message is not UTF-8: {}", e)))?
            .to_string();

        Ok(Self {
            kind: ServerErrorKind::from_code(code),
            message,
        })
    }

    pub fn encode(&self) -> Bytes {
        let message = self.message.as_bytes();
        let len = message.len().min(u16::MAX as usize);
        let mut buf = BytesMut::with_capacity(6 + len);
        buf.put_i32(self.kind.code());
        buf.put_u16(len as u16);
        buf.extend_from_slice(&message[..len]);
        buf.freeze()
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_envelope() {
        let error = ServerError::new(ServerErrorKind::Overloaded, "queue full");
        let decoded = ServerError::decode(&error.encode()).unwrap();
        assert_eq!(decoded, error);
    }

    #[test]
    fn test_server_error_ignores_trailing_fields() {
        let mut body = BytesMut::new();
        body.put_i32(0x1200);
        body.put_u16(2);
        body.extend_from_slice(b"rt");
        body.put_u16(1); // consistency, not decoded
        let decoded = ServerError::decode(&body).unwrap();
        assert_eq!(decoded.kind, ServerErrorKind::ReadTimeout);
        assert_eq!(decoded.message, "rt");
    }

    #[test]
    fn test_server_error_short_body() {
        assert!(ServerError::decode(&[0, 0, 0]).is_err());

        let mut body = BytesMut::new();
        body.put_i32(0);
        body.put_u16(10);
        body.extend_from_slice(b"abc");
        assert!(ServerError::decode(&body).is_err());
    }

    #[test]
    fn test_empty_response() {
        let response = Response::empty();
        assert!(response.is_empty());
        assert_eq!(response.opcode, Opcode::Result);
    }
}
