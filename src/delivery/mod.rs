//! Delivery of decoded readings to the ingestion endpoint
//!
//! - [`policy`]: immutable backoff configuration
//! - [`client`]: one HTTP attempt
//! - [`engine`]: attempt loop with classification and interruptible backoff
//! - [`pipeline`]: concurrent per-reading tasks, drain on shutdown
//! - [`dead_letter`]: hand-off for terminal failures

pub mod client;
pub mod dead_letter;
pub mod engine;
pub mod pipeline;
pub mod policy;

pub use client::{HttpIngestClient, IngestAck, IngestClient, SendError, API_KEY_HEADER};
pub use dead_letter::{
    ChannelDeadLetterSink, DeadLetterSink, FailedDelivery, LoggingDeadLetterSink,
};
pub use engine::{
    classify, AttemptOutcome, DeliveryAttempt, DeliveryOutcome, FailureReason, RetryEngine,
    TerminalKind,
};
pub use pipeline::{DeliveryPipeline, DrainReport};
pub use policy::{PolicyError, RetryPolicy};
