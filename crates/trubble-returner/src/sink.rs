//! The returner interface

use crate::error::TransportError;
use crate::event::JobReturn;
use crate::retry::{with_backoff, RetryPolicy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A reporting endpoint results are delivered to
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Returner name referenced by schedule configuration
    fn name(&self) -> &str;

    /// Deliver one job result
    async fn deliver(&self, ret: &JobReturn) -> Result<(), TransportError>;

    /// Deliver with retries per `policy`
    ///
    /// Sinks that fan out to several endpoints override this so that an
    /// endpoint which already accepted the result is not sent it again.
    async fn deliver_retrying(
        &self,
        ret: &JobReturn,
        policy: &RetryPolicy,
    ) -> Result<(), TransportError> {
        with_backoff(policy, self.name(), &ret.jid, move || self.deliver(ret)).await
    }
}

/// Returners by name
#[derive(Default, Clone)]
pub struct SinkRegistry {
    sinks: HashMap<String, Arc<dyn DeliverySink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Arc<dyn DeliverySink>) {
        self.sinks.insert(sink.name().to_string(), sink);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DeliverySink>> {
        self.sinks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sinks.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sinks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("sinks", &self.names())
            .finish()
    }
}
