//! Tessera Connection Layer
//!
//! Multiplexed connections to database nodes and the per-node pools that
//! keep them alive.
//!
//! # Architecture
//!
//! - [`Channel`]: one TCP connection carrying up to `max_streams` concurrent
//!   requests, correlated by stream id. A single actor task owns the
//!   stream-id table; callers get a [`ResponseHandle`] per request.
//! - [`ConnectionPool`]: keeps a target number of channels open to one node,
//!   reconnects with exponential backoff and jitter, and reports
//!   [`PoolEvent::Up`]/[`PoolEvent::Down`] when the number of usable channels
//!   crosses zero.
//!
//! # Request Lifecycle
//!
//! 1. [`Channel::send`] reserves capacity or fails at once with
//!    [`ChannelError::Busy`]
//! 2. The actor assigns the lowest free stream id and writes the frame
//! 3. The response releases the id and completes the handle
//! 4. A handle that times out or is dropped first leaves its id *orphaned*
//!    until the late response arrives and is discarded
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tessera_common::protocol::Opcode;
//! use tessera_pool::{Channel, ChannelConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let channel = Channel::connect("127.0.0.1:9042".parse()?, ChannelConfig::default(), None).await?;
//! let handle = channel.send(Opcode::Query, "SELECT 1".into())?;
//! let frame = handle.wait(Duration::from_secs(5)).await?;
//! println!("{:?} with {} bytes", frame.opcode, frame.body.len());
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod pool;
pub mod reconnect;
mod stream_ids;

pub use channel::{Channel, ChannelConfig, ChannelError, ResponseHandle};
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolEvent, PoolState};
pub use reconnect::ReconnectionSchedule;
