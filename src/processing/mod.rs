//! Topic routing and payload decoding for inbound device telemetry

pub mod decoder;
pub mod router;

pub use decoder::{decode, generate_message_id, DecodeError};
pub use router::TopicRouter;
