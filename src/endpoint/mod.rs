//! Reference ingestion endpoint
//!
//! The HTTP side of the contract the delivery pipeline talks to:
//! rate limiting, shared-secret auth, body validation and device lookup for
//! `POST /api/internal/data`. Used by the `ingest-endpoint` binary and by the
//! end-to-end tests.

pub mod auth;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod validation;

use std::net::SocketAddr;
use thiserror::Error;

pub use auth::{mask_key, AuthDecision, InternalAuth};
pub use rate_limit::{FixedWindowRateLimiter, RateDecision};
pub use registry::{DeviceRecord, DeviceRegistry, InMemoryDeviceRegistry, RegistryError};
pub use server::{ingest_routes, serve, IngestState};
pub use validation::IngestValidator;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Invalid ingestion schema: {0}")]
    Schema(String),

    #[error("Device registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Failed to bind ingestion endpoint on {addr}: {message}")]
    Bind { addr: SocketAddr, message: String },
}
