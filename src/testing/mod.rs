//! Testing utilities and mock implementations
//!
//! Lets the connection lifecycle be exercised without a broker or a disk.

pub mod mocks;

pub use mocks::*;
