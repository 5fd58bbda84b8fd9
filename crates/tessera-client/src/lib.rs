//! Tessera Client
//!
//! The [`Session`] is what applications hold: it owns the node registry and
//! its connection pools, the worker pool requests run on and the metrics
//! registry, and hands out a [`ResponseFuture`] per submitted request.

pub mod response;
pub mod session;

pub use response::ResponseFuture;
pub use session::{Session, SessionBuilder};
