//! Tessera Runtime
//!
//! Caller-facing work (retry decisions, speculative timers, result delivery)
//! runs here instead of on channel I/O tasks, so a slow application callback
//! can never stall a connection.
//!
//! # Components
//!
//! - **[`Scheduler`]**: delayed callbacks and spawned futures on a worker pool
//!   bounded by a semaphore, with graceful shutdown
//! - **[`ShutdownGroup`]**: waits for several asynchronous shutdowns at once and
//!   folds their outcomes into a [`ShutdownReport`]
//!
//! The scheduler runs on the tokio runtime it was created in; it does not own
//! threads of its own.

mod error;
mod scheduler;
mod shutdown;

pub use error::SchedulerError;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerShutdown, TimerHandle};
pub use shutdown::{ShutdownGroup, ShutdownReport};
