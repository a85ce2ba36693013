//! Shared types and collaborator contracts for the thinglog recorder.
//!
//! The engine depends only on this crate: the message bus, the file sink
//! and the binary all meet at the traits defined in [`transport`].

pub mod describe;
pub mod error;
pub mod record;
pub mod transport;

pub use describe::{PropertyDescription, ServiceDescription};
pub use error::{ApiError, ErrorKind};
pub use record::{received_at_now, LogRecord, RawPayload, RECEIVED_AT_FORMAT};
pub use transport::{
    BoxFuture, Connection, Delivery, DescriptionPublisher, MessageHandler, SubscriptionSource,
    SubscriptionToken, TopicFilter,
};
