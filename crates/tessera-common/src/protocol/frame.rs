//! Tessera wire frame.
//!
//! Every message on a connection is a frame: a fixed 9-byte header followed by
//! an opaque body. The stream id in the header is what lets a single
//! connection carry many concurrent requests.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::ProtocolError;

/// Protocol version spoken by this engine.
pub const PROTOCOL_VERSION: u8 = 4;

/// Set on the version byte of frames sent by the server.
pub const RESPONSE_FLAG: u8 = 0x80;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 9;

/// Largest accepted frame body (256 MiB).
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

/// Stream id the server uses for pushed events.
pub const EVENT_STREAM_ID: i16 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        let opcode = match value {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(opcode)
    }
}

/// Decoded fixed-size part of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: Opcode,
    pub length: usize,
}

impl FrameHeader {
    /// Parses and validates a header.
    ///
    /// Rejects foreign protocol versions, unknown opcodes and bodies larger
    /// than [`MAX_BODY_LEN`] before any body allocation happens.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let version = buf[0];
        if version & !RESPONSE_FLAG != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version & !RESPONSE_FLAG));
        }
        let flags = buf[1];
        let stream = i16::from_be_bytes([buf[2], buf[3]]);
        let opcode = Opcode::try_from(buf[4])?;
        let length = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
        if length > MAX_BODY_LEN {
            return Err(ProtocolError::FrameTooLarge(length, MAX_BODY_LEN));
        }

        Ok(Self {
            version,
            flags,
            stream,
            opcode,
            length,
        })
    }
}

/// A complete frame with its opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: Opcode,
    pub body: Bytes,
}

impl Frame {
    /// Creates a client-to-server frame.
    pub fn request(stream: i16, opcode: Opcode, body: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            stream,
            opcode,
            body: body.into(),
        }
    }

    /// Creates a server-to-client frame.
    pub fn response(stream: i16, opcode: Opcode, body: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION | RESPONSE_FLAG,
            flags: 0,
            stream,
            opcode,
            body: body.into(),
        }
    }

    pub fn from_parts(header: FrameHeader, body: Bytes) -> Self {
        Self {
            version: header.version,
            flags: header.flags,
            stream: header.stream,
            opcode: header.opcode,
            body,
        }
    }

    pub fn is_response(&self) -> bool {
        self.version & RESPONSE_FLAG != 0
    }

    /// Re-targets the frame to another stream id.
    pub fn with_stream(mut self, stream: i16) -> Self {
        self.stream = stream;
        self
    }

    /// Serializes header and body into one contiguous buffer.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.body.len() > MAX_BODY_LEN {
            return Err(ProtocolError::FrameTooLarge(self.body.len(), MAX_BODY_LEN));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body.len());
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_i16(self.stream);
        buf.put_u8(self.opcode as u8);
        buf.put_u32(self.body.len() as u32);
        buf.extend_from_slice(&self.body);
        Ok(buf.freeze())
    }

    /// Decodes a frame from a buffer holding exactly one frame.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::Malformed(format!(
                "Frame shorter than header: {} bytes",
                buf.len()
            )));
        }
        let mut header_buf = [0u8; HEADER_LEN];
        header_buf.copy_from_slice(&buf[..HEADER_LEN]);
        let header = FrameHeader::decode(&header_buf)?;

        let body = &buf[HEADER_LEN..];
        if body.len() != header.length {
            return Err(ProtocolError::Malformed(format!(
                "Header announces {} body bytes, got {}",
                header.length,
                body.len()
            )));
        }

        Ok(Self::from_parts(header, Bytes::copy_from_slice(body)))
    }
}
