//! Test utilities.
//!
//! Enabled for this crate's own tests and, through the `test-util` feature,
//! for the tests of downstream crates.

mod mock_node;

pub use mock_node::{Behavior, MockNode};
