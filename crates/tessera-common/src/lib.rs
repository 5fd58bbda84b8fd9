//! Tessera Common Types and Transport
//!
//! This crate provides the wire protocol definitions, error taxonomy and TCP
//! transport shared by every Tessera component.
//!
//! # Overview
//!
//! Tessera is a driver-side request engine for clustered databases. Requests
//! travel over a small number of long-lived TCP connections per node, each of
//! which multiplexes many in-flight requests by stream id. This crate contains
//! the pieces every other layer agrees on:
//!
//! - **Protocol Layer**: frame header, opcodes, request/response models, errors
//! - **Transport Layer**: framed TCP reads/writes and the payload codec seam
//! - **Authentication**: the per-connection handshake authenticator
//! - **Configuration**: the serde-deserializable [`DriverConfig`]
//!
//! # Wire Format
//!
//! ```text
//! [version u8][flags u8][stream i16][opcode u8][length u32] [body ...]
//! ```
//!
//! All integers are big-endian. The high bit of `version` marks responses.
//!
//! # Example
//!
//! ```
//! use tessera_common::protocol::{Frame, Opcode};
//!
//! let frame = Frame::request(7, Opcode::Query, &b"SELECT 1"[..]);
//! let encoded = frame.encode().unwrap();
//! assert_eq!(encoded.len(), 9 + 8);
//! ```

pub mod auth;
pub mod config;
pub mod protocol;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use auth::{AuthConfig, Authenticator, PlainTextAuthenticator};
pub use config::DriverConfig;
pub use protocol::*;
