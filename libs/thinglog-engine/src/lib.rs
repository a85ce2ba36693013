//! Routing and file lifecycle of the thinglog recorder.
//!
//! [`LogRouter`] owns the start/stop lifecycle and the subscription
//! topology; [`FileSink`] owns the per-entity log files.

pub mod config;
pub mod describe;
pub mod error;
pub mod filename;
pub mod router;
pub mod sink;

pub use config::{Durability, HostPaths, LoggerConfig, RoutingConfig};
pub use error::{RouterError, SinkError};
pub use router::{LogRouter, RouterState};
pub use sink::FileSink;
