//! Testing utilities and mock implementations
//!
//! Mock capabilities for exercising the connection manager without a radio,
//! a broker or real time passing.

pub mod mocks;

pub use mocks::*;
