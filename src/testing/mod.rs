//! Testing utilities and mock implementations
//!
//! Fakes for the ingestion client, the broker publisher and the device
//! registry so every layer can be tested without external services.

pub mod mocks;

pub use mocks::*;
