pub mod error;
pub mod frame;
pub mod requests;
pub mod responses;

#[cfg(test)]
mod tests;

pub use error::{ErrorClass, ProtocolError, Result, ServerErrorKind, TesseraError};
pub use frame::{Frame, Opcode, EVENT_STREAM_ID, HEADER_LEN, MAX_BODY_LEN, PROTOCOL_VERSION};
pub use requests::{ExecutionOptions, Request};
pub use responses::{Response, ServerError};
