//! Trubble Returner - Delivery of job results to reporting endpoints
//!
//! This crate provides:
//! - `JobReturn`: The envelope every scheduled job result travels in
//! - `DeliverySink`: The async interface implemented by every returner
//! - `deliver_with_retry`: Bounded exponential-backoff delivery
//! - `HecSink`: Splunk HTTP event collector returner
//! - `HecLogLayer`: Forwards the agent's own log records to the collectors
//! - `StdoutSink`: JSON lines on standard output

pub mod error;
pub mod event;
pub mod hec;
pub mod hec_log;
pub mod identity;
pub mod retry;
pub mod sink;
pub mod stdout;

pub use error::TransportError;
pub use event::{new_jid, JobReturn};
pub use hec::{HecCollector, HecSink};
pub use hec_log::HecLogLayer;
pub use identity::HostIdentity;
pub use retry::{deliver_with_retry, RetryPolicy};
pub use sink::{DeliverySink, SinkRegistry};
pub use stdout::StdoutSink;
