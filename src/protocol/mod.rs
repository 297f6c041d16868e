//! Device telemetry protocol: topic shapes and message types
//!
//! Shared by the MQTT side of the bridge, the delivery pipeline and the
//! reference ingestion endpoint.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
