//! Forwarding of the agent's own log records to Splunk
//!
//! `HecLogLayer` turns tracing events into flat JSON records and queues them
//! for a background task, which ships them through [`HecSink::forward_logs`]
//! with each collector's `sourcetype_log`. Events raised by the delivery path
//! itself are never forwarded.

use crate::hec::HecSink;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::field::{Field, Visit};
use tracing::{debug, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// One forwarded log record
pub type LogRecord = Map<String, Value>;

/// Event targets that are never forwarded
const SUPPRESSED_TARGETS: &[&str] = &["trubble_returner", "reqwest", "hyper", "h2", "rustls"];

/// Pending records that trigger a flush before the interval elapses
pub const MAX_PENDING_RECORDS: usize = 500;

/// Tracing layer queueing log records for the forwarder task
pub struct HecLogLayer {
    tx: UnboundedSender<LogRecord>,
    max_level: Level,
}

impl HecLogLayer {
    /// Layer forwarding events at `max_level` or more severe
    pub fn new(tx: UnboundedSender<LogRecord>, max_level: Level) -> Self {
        Self { tx, max_level }
    }

    /// Layer plus a running forwarder shipping its records through `sink`
    pub fn spawn(sink: Arc<HecSink>, max_level: Level, interval: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward(sink, rx, interval));
        (Self::new(tx, max_level), forwarder)
    }

    fn forwards(&self, metadata: &tracing::Metadata<'_>) -> bool {
        *metadata.level() <= self.max_level
            && !SUPPRESSED_TARGETS
                .iter()
                .any(|target| metadata.target().starts_with(target))
    }
}

impl<S: Subscriber> Layer<S> for HecLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !self.forwards(metadata) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let mut record = visitor.fields;
        record.insert("message".into(), json!(visitor.message));
        record.insert("level".into(), json!(metadata.level().to_string()));
        record.insert("loggername".into(), json!(metadata.target()));
        record.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));

        // a closed channel means the forwarder has stopped
        let _ = self.tx.send(record);
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: LogRecord,
}

impl RecordVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for RecordVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, json!(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, json!(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, json!(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, json!(format!("{:?}", value)));
    }
}

/// Ship queued records every `interval`, or once `MAX_PENDING_RECORDS` are waiting
///
/// Remaining records are flushed once every sender is gone.
pub async fn forward(sink: Arc<HecSink>, mut rx: UnboundedReceiver<LogRecord>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pending = Vec::new();

    loop {
        let flush = tokio::select! {
            received = rx.recv() => match received {
                Some(record) => {
                    pending.push(record);
                    pending.len() >= MAX_PENDING_RECORDS
                }
                None => break,
            },
            _ = ticker.tick() => true,
        };
        if flush {
            ship(&sink, &mut pending).await;
        }
    }
    ship(&sink, &mut pending).await;
}

async fn ship(sink: &HecSink, pending: &mut Vec<LogRecord>) {
    if pending.is_empty() {
        return;
    }
    let records = std::mem::take(pending);
    if let Err(e) = sink.forward_logs(&records).await {
        debug!(records = records.len(), error = %e, "Dropped forwarded log records");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;
    use trubble_common::{ReturnerConfig, SplunkConfig};
    use trubble_core::{AttributeSnapshot, SnapshotSource};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_layer_builds_records() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(HecLogLayer::new(tx, Level::INFO));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "trubble_agent::daemon", job = "nova_daily", retries = 2, ok = true, "Job {} fired", "nova_daily");
            tracing::debug!(target: "trubble_agent::daemon", "Too verbose to forward");
            tracing::warn!(target: "trubble_returner::hec", "Delivery chatter");
            tracing::warn!(target: "hyper::client", "Connection reset");
        });

        let record = rx.try_recv().unwrap();
        assert_eq!(record["message"], "Job nova_daily fired");
        assert_eq!(record["level"], "INFO");
        assert_eq!(record["loggername"], "trubble_agent::daemon");
        assert_eq!(record["job"], "nova_daily");
        assert_eq!(record["retries"], 2);
        assert_eq!(record["ok"], true);
        assert!(record["timestamp"].as_str().is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forwarder_flushes_when_senders_close() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut config = SplunkConfig::new("tok-123", server.address().ip().to_string(), "trubble");
        config.port = server.address().port();
        config.hec_ssl = false;
        let returner = ReturnerConfig {
            splunk: vec![config],
            ..Default::default()
        };
        let snapshots: Arc<dyn SnapshotSource> = Arc::new(|| {
            AttributeSnapshot::new()
                .with_grain("id", "web1")
                .with_grain("ipv4", json!(["10.0.0.5"]))
        });
        let sink = Arc::new(HecSink::new(&returner, snapshots, "web1").unwrap());

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward(sink, rx, Duration::from_secs(3600)));
        for n in 0..3 {
            let mut record = LogRecord::new();
            record.insert("message".into(), json!(format!("record {}", n)));
            tx.send(record).unwrap();
        }
        drop(tx);
        forwarder.await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        let sent: Vec<Value> = serde_json::Deserializer::from_str(&body)
            .into_iter::<Value>()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2]["event"]["message"], "record 2");
        assert_eq!(sent[0]["sourcetype"], "trubble_log");
    }
}
