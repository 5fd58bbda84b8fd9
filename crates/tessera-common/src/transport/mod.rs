//! Tessera Transport Layer
//!
//! This module moves frames between a socket and the engine.
//!
//! # Architecture
//!
//! - **[`FrameTransport`]**: async connect with a bounded timeout and framed
//!   reads/writes over any `AsyncRead`/`AsyncWrite` half
//! - **[`PayloadCodec`]**: the seam through which the embedding application
//!   turns statements into frame bodies and frame bodies into responses
//!
//! # Message Size Limits
//!
//! Frame headers announcing a body larger than
//! [`MAX_BODY_LEN`](crate::protocol::MAX_BODY_LEN) are rejected before the body
//! is read.

pub mod codec;
pub mod tcp;

pub use codec::{EncodeContext, PassThroughCodec, PayloadCodec};
pub use tcp::FrameTransport;
