use bytes::Bytes;

use crate::protocol::error::ProtocolError;
use crate::protocol::{Frame, Request, Response};

/// Per-attempt values the codec may need to serialize a statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeContext {
    pub page_size: Option<u32>,
}

/// Encodes statements into frame bodies and decodes result frames.
///
/// The engine never inspects bodies itself; everything between the frame
/// header and the bytes on the wire belongs to the codec.
///
/// # Example
///
/// ```
/// use tessera_common::transport::{EncodeContext, PassThroughCodec, PayloadCodec};
/// use tessera_common::protocol::{Frame, Opcode, Request};
///
/// let codec = PassThroughCodec;
/// let body = codec.encode(&Request::query(&b"SELECT 1"[..]), &EncodeContext::default()).unwrap();
/// assert_eq!(&body[..], b"SELECT 1");
///
/// let response = codec.decode(Frame::response(1, Opcode::Result, body)).unwrap();
/// assert_eq!(&response.body[..], b"SELECT 1");
/// ```
pub trait PayloadCodec: Send + Sync + 'static {
    fn encode(&self, request: &Request, ctx: &EncodeContext) -> Result<Bytes, ProtocolError>;

    fn decode(&self, frame: Frame) -> Result<Response, ProtocolError>;
}

/// Sends request bodies as-is and hands RESULT bodies back untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughCodec;

impl PayloadCodec for PassThroughCodec {
    fn encode(&self, request: &Request, _ctx: &EncodeContext) -> Result<Bytes, ProtocolError> {
        Ok(request.body.clone())
    }

    fn decode(&self, frame: Frame) -> Result<Response, ProtocolError> {
        Ok(Response::new(frame.opcode, frame.body))
    }
}
