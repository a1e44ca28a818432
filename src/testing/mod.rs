//! Testing utilities and mock implementations
//!
//! Mock sessions and recording handlers for exercising the lifecycle engine
//! without a broker.

pub mod mocks;

pub use mocks::*;
