//! Testing utilities and mock implementations
//!
//! Lets the session and registry be exercised without an MQTT broker.

pub mod mocks;

pub use mocks::*;
