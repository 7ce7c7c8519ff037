//! Splunk HTTP event collector returner
//!
//! Events are batched and posted to `/services/collector/event` as
//! space-separated JSON objects. A batch is flushed before it would exceed
//! `MAX_CONTENT_BYTES`; each flush tries the configured indexers in order
//! until one accepts it. A batch that fails on every indexer is retried on its
//! own, so batches already accepted are never posted twice.

use crate::error::TransportError;
use crate::event::JobReturn;
use crate::identity::HostIdentity;
use crate::retry::{is_permanent, with_backoff, RetryPolicy};
use crate::sink::DeliverySink;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use trubble_common::{ReturnerConfig, SplunkConfig};
use trubble_core::attributes::{scalar_string, scalar_strings};
use trubble_core::{AttributeSnapshot, SnapshotSource};

/// Largest batch body the collector reliably accepts
pub const MAX_CONTENT_BYTES: usize = 100_000;

const COLLECTOR_PATH: &str = "/services/collector/event";

/// Result sections of an audit return that become one event per check
const CHECK_SECTIONS: &[&str] = &["Failure", "Success", "Controlled"];

/// Result keys left out of check events
const DROPPED_RESULT_KEYS: &[&str] = &["tags"];

/// Batching client for one collector configuration
pub struct HecCollector {
    http: Client,
    token: String,
    servers: Vec<String>,
    batch: Vec<String>,
    batch_bytes: usize,
    max_bytes: usize,
    retry: RetryPolicy,
    jid: String,
}

impl HecCollector {
    /// Collector posting to `indexer` (comma-separated for failover; `host:port` overrides the port)
    pub fn new(config: &SplunkConfig, indexer: &str) -> Result<Self, TransportError> {
        if config.token.trim().is_empty() {
            return Err(TransportError::NotConfigured("splunk token is required".into()));
        }
        if !(config.timeout.is_finite() && config.timeout > 0.0) {
            return Err(TransportError::NotConfigured(format!(
                "invalid collector timeout: {}",
                config.timeout
            )));
        }

        let scheme = if config.hec_ssl { "https" } else { "http" };
        let servers: Vec<String> = indexer
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|server| {
                if server.contains(':') {
                    format!("{}://{}{}", scheme, server, COLLECTOR_PATH)
                } else {
                    format!("{}://{}:{}{}", scheme, server, config.port, COLLECTOR_PATH)
                }
            })
            .collect();
        if servers.is_empty() {
            return Err(TransportError::NotConfigured("splunk indexer is required".into()));
        }

        let mut builder = Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout))
            .user_agent(format!("trubble/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(!config.http_event_collector_ssl_verify);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::all(format!("{}://{}", scheme, proxy))?);
        }

        Ok(Self {
            http: builder.build()?,
            token: config.token.trim().to_string(),
            servers,
            batch: Vec::new(),
            batch_bytes: 0,
            max_bytes: MAX_CONTENT_BYTES,
            retry: RetryPolicy::single_attempt(),
            jid: String::new(),
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Retry each batch per `policy` when no server accepts it
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Job the batched events belong to, for log records
    pub fn with_jid(mut self, jid: impl Into<String>) -> Self {
        self.jid = jid.into();
        self
    }

    /// Collector endpoints in failover order
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Events waiting for the next flush
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Queue an event payload, flushing first if it would overflow the batch
    pub async fn batch_event(&mut self, payload: Map<String, Value>) -> Result<(), TransportError> {
        let mut data = Map::new();
        data.insert("time".into(), json!(Utc::now().timestamp().to_string()));
        data.extend(payload);
        let encoded = serde_json::to_string(&Value::Object(data))?;

        if !self.batch.is_empty() && self.batch_bytes + encoded.len() > self.max_bytes {
            debug!(events = self.batch.len(), "Auto-flushing collector batch");
            self.flush().await?;
        }

        self.batch_bytes += encoded.len();
        self.batch.push(encoded);
        Ok(())
    }

    /// Send queued events; the batch is cleared whether or not a server accepts it
    pub async fn flush(&mut self) -> Result<(), TransportError> {
        if self.batch.is_empty() {
            return Ok(());
        }

        let body = self.batch.join(" ");
        let events = self.batch.len();
        self.batch.clear();
        self.batch_bytes = 0;

        let this: &Self = self;
        let body = body.as_str();
        with_backoff(&this.retry, "splunk", &this.jid, move || this.send(body)).await?;
        debug!(events, "Flushed events to collector");
        Ok(())
    }

    /// Post one batch body to the first server that accepts it
    async fn send(&self, body: &str) -> Result<(), TransportError> {
        let mut last_error = None;
        let mut all_permanent = true;
        for server in &self.servers {
            match self.post(server, body.to_string()).await {
                Ok(()) => {
                    debug!(server = %server, "Collector accepted batch");
                    return Ok(());
                }
                Err(e) => {
                    info!("Request to splunk server {} failed: {}", server, e);
                    all_permanent &= is_permanent(&e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if all_permanent => Err(e),
            last => Err(TransportError::AllServersFailed {
                attempted: self.servers.len(),
                last: last.map(|e| e.to_string()).unwrap_or_default(),
            }),
        }
    }

    async fn post(&self, server: &str, body: String) -> Result<(), TransportError> {
        let res = self
            .http
            .post(server)
            .header("Authorization", format!("Splunk {}", self.token))
            .body(body)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let message = res.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, message });
        }
        Ok(())
    }
}

/// Returner forwarding job results to every configured collector
pub struct HecSink {
    returner: ReturnerConfig,
    dropins: Option<PathBuf>,
    snapshots: Arc<dyn SnapshotSource>,
    hostname: String,
}

impl HecSink {
    pub const NAME: &'static str = "splunk_nova_return";

    /// Sink for the `[returner]` section; `snapshots` supplies grains for host identity
    pub fn new(
        returner: &ReturnerConfig,
        snapshots: Arc<dyn SnapshotSource>,
        hostname: impl Into<String>,
    ) -> Result<Self, TransportError> {
        if returner.splunk.is_empty() {
            return Err(TransportError::NotConfigured(
                "no [[returner.splunk]] collectors configured".into(),
            ));
        }

        Ok(Self {
            returner: returner.clone(),
            dropins: None,
            snapshots,
            hostname: hostname.into(),
        })
    }

    /// Re-read collector drop-ins from `dir` before every delivery
    pub fn with_dropin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dropins = Some(dir.into());
        self
    }

    /// Host attributes and collector list as of this delivery
    async fn prepare(&self) -> Result<(AttributeSnapshot, Vec<SplunkConfig>), TransportError> {
        let snapshots = Arc::clone(&self.snapshots);
        let returner = self.returner.clone();
        let dropins = self.dropins.clone();
        tokio::task::spawn_blocking(move || {
            let configs = match dropins {
                Some(dir) => returner.with_dropins(&dir).splunk,
                None => returner.splunk,
            };
            (snapshots.capture(), configs)
        })
        .await
        .map_err(|e| TransportError::Identity(format!("grain collection failed: {}", e)))
    }

    /// `fallback_indexer` applies when the host has no default gateway
    fn indexer<'a>(config: &'a SplunkConfig, snapshot: &AttributeSnapshot) -> &'a str {
        let no_gateway = matches!(snapshot.grain("ip_gw"), Some(Value::Bool(false)));
        match (&config.fallback_indexer, no_gateway) {
            (Some(fallback), true) => fallback,
            _ => &config.indexer,
        }
    }

    /// Identity and custom fields shared by every event
    fn common_fields(
        snapshot: &AttributeSnapshot,
        identity: &HostIdentity,
        config: &SplunkConfig,
    ) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("master".into(), json!(identity.master));
        fields.insert("minion_id".into(), json!(identity.minion_id));
        fields.insert("dest_host".into(), json!(identity.fqdn));
        fields.insert("dest_ip".into(), json!(identity.ip));
        fields.insert("dest_fqdn".into(), json!(identity.local_fqdn));
        if let Some(uuid) = &identity.system_uuid {
            fields.insert("system_uuid".into(), json!(uuid));
        }

        if let Some(Value::Object(cloud)) = snapshot.grain("cloud_details") {
            fields.extend(cloud.clone());
        }

        for name in &config.custom_fields {
            let value = snapshot.pillar(name).or_else(|| snapshot.grain(name));
            match value {
                Some(Value::Array(_)) => {
                    let joined = value.map(scalar_strings).unwrap_or_default().join(",");
                    fields.insert(format!("custom_{}", name), json!(joined));
                }
                Some(v) => {
                    if let Some(s) = scalar_string(v) {
                        fields.insert(format!("custom_{}", name), json!(s));
                    }
                }
                None => {}
            }
        }
        fields
    }

    fn payload(
        &self,
        identity: &HostIdentity,
        config: &SplunkConfig,
        sourcetype: &str,
        mut event: Map<String, Value>,
    ) -> Map<String, Value> {
        event.retain(|_, v| v.as_str() != Some(""));

        let mut fields = Map::new();
        for name in &self.returner.index_extracted_fields {
            if let Some(value) = event.get(name).and_then(scalar_string) {
                fields.insert(name.clone(), json!(value));
            }
        }

        let mut payload = Map::new();
        payload.insert("host".into(), json!(identity.fqdn));
        payload.insert("index".into(), json!(config.index));
        payload.insert("sourcetype".into(), json!(sourcetype));
        payload.insert("event".into(), Value::Object(event));
        if !fields.is_empty() {
            payload.insert("fields".into(), Value::Object(fields));
        }
        payload
    }

    /// One event per classified check plus a compliance event
    fn audit_events(
        &self,
        ret: &JobReturn,
        common: Map<String, Value>,
        identity: &HostIdentity,
        config: &SplunkConfig,
    ) -> Vec<Map<String, Value>> {
        let mut payloads = Vec::new();

        for section in CHECK_SECTIONS {
            let items = ret
                .ret
                .get(*section)
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();

            for item in items {
                let Some((check_id, body)) = item.as_object().and_then(|o| o.iter().next()) else {
                    continue;
                };

                let mut event = Map::new();
                event.insert("check_result".into(), json!(section));
                event.insert("check_id".into(), json!(check_id));
                event.insert("job_id".into(), json!(ret.jid));
                match body {
                    Value::Object(details) => event.extend(
                        details
                            .iter()
                            .filter(|(key, _)| !DROPPED_RESULT_KEYS.contains(&key.as_str()))
                            .map(|(key, value)| (key.clone(), value.clone())),
                    ),
                    other => {
                        event.insert("description".into(), other.clone());
                    }
                }
                event.extend(common.clone());
                payloads.push(self.payload(identity, config, &config.sourcetype_nova, event));
            }
        }

        if let Some(compliance) = ret.ret.get("Compliance") {
            let mut event = Map::new();
            event.insert("job_id".into(), json!(ret.jid));
            event.insert("compliance_percentage".into(), compliance.clone());
            event.extend(common);
            payloads.push(self.payload(identity, config, &config.sourcetype_nova, event));
        }

        payloads
    }

    /// A single event carrying the whole return value
    fn log_event(
        &self,
        ret: &JobReturn,
        common: Map<String, Value>,
        identity: &HostIdentity,
        config: &SplunkConfig,
    ) -> Map<String, Value> {
        let mut event = Map::new();
        event.insert("job_id".into(), json!(ret.jid));
        event.insert("fun".into(), json!(ret.fun));
        event.insert("success".into(), json!(ret.success));
        event.insert("return".into(), ret.ret.clone());
        event.extend(common);
        self.payload(identity, config, &config.sourcetype_log, event)
    }

    async fn deliver_to(
        &self,
        ret: &JobReturn,
        snapshot: &AttributeSnapshot,
        identity: &HostIdentity,
        config: &SplunkConfig,
        policy: &RetryPolicy,
    ) -> Result<(), TransportError> {
        let mut collector = HecCollector::new(config, Self::indexer(config, snapshot))?
            .with_retry(policy.clone())
            .with_jid(ret.jid.as_str());

        let common = Self::common_fields(snapshot, identity, config);
        let payloads = if ret.is_audit() && ret.ret.is_object() {
            self.audit_events(ret, common, identity, config)
        } else {
            vec![self.log_event(ret, common, identity, config)]
        };

        debug!(
            jid = %ret.jid,
            index = %config.index,
            events = payloads.len(),
            "Sending events to collector"
        );
        for payload in payloads {
            collector.batch_event(payload).await?;
        }
        collector.flush().await
    }

    /// Ship agent log records to every collector as `sourcetype_log` events
    pub async fn forward_logs(&self, records: &[Map<String, Value>]) -> Result<(), TransportError> {
        if records.is_empty() {
            return Ok(());
        }

        let (snapshot, configs) = self.prepare().await?;
        let minion_id = snapshot.id().unwrap_or(self.hostname.as_str()).to_string();
        let identity = HostIdentity::from_snapshot(&snapshot, &minion_id, &self.hostname)?;

        let mut first_error = None;
        for config in &configs {
            if let Err(e) = self.forward_to(records, &snapshot, &identity, config).await {
                warn!(index = %config.index, error = %e, "Log forwarding failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn forward_to(
        &self,
        records: &[Map<String, Value>],
        snapshot: &AttributeSnapshot,
        identity: &HostIdentity,
        config: &SplunkConfig,
    ) -> Result<(), TransportError> {
        let mut collector = HecCollector::new(config, Self::indexer(config, snapshot))?;
        let common = Self::common_fields(snapshot, identity, config);
        for record in records {
            let mut event = record.clone();
            event.extend(common.clone());
            collector
                .batch_event(self.payload(identity, config, &config.sourcetype_log, event))
                .await?;
        }
        collector.flush().await
    }
}

#[async_trait]
impl DeliverySink for HecSink {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn deliver(&self, ret: &JobReturn) -> Result<(), TransportError> {
        self.deliver_retrying(ret, &RetryPolicy::single_attempt()).await
    }

    /// Each collector is retried on its own; one that accepted the result is not resent
    async fn deliver_retrying(
        &self,
        ret: &JobReturn,
        policy: &RetryPolicy,
    ) -> Result<(), TransportError> {
        let (snapshot, configs) = self.prepare().await?;
        let identity = HostIdentity::from_snapshot(&snapshot, &ret.id, &self.hostname)?;

        let mut first_error = None;
        for config in &configs {
            if let Err(e) = self.deliver_to(ret, &snapshot, &identity, config, policy).await {
                warn!(index = %config.index, error = %e, "Collector delivery failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn splunk_for(server: &MockServer) -> SplunkConfig {
        let mut config = SplunkConfig::new("tok-123", server.address().ip().to_string(), "trubble");
        config.port = server.address().port();
        config.hec_ssl = false;
        config.custom_fields = vec!["site".into()];
        config
    }

    fn web1() -> AttributeSnapshot {
        AttributeSnapshot::new()
            .with_grain("id", "web1")
            .with_grain("fqdn", "web1.example.com")
            .with_grain("ipv4", json!(["127.0.0.1", "10.0.0.5"]))
            .with_grain("master", "salt.example.com")
            .with_pillar("site", json!(["dc1", "dc2"]))
    }

    fn fixed(snapshot: AttributeSnapshot) -> Arc<dyn SnapshotSource> {
        Arc::new(move || snapshot.clone())
    }

    fn quick_retries(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2,
        }
    }

    fn events(request: &Request) -> Vec<Value> {
        let body = String::from_utf8(request.body.clone()).unwrap();
        serde_json::Deserializer::from_str(&body)
            .into_iter::<Value>()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    fn audit_return() -> JobReturn {
        JobReturn::new(
            "web1",
            "nova.top",
            json!({
                "Success": [{"os_supported": "Supported operating system"}],
                "Failure": [{"kernel_pinned": {
                    "description": "Kernel is pinned",
                    "detail": "",
                    "tags": ["CIS-3"]
                }}],
                "Controlled": [{"telnet_absent": "Telnet is absent"}],
                "Errors": [],
                "Compliance": 67
            }),
        )
    }

    #[tokio::test]
    async fn test_audit_return_becomes_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/services/collector/event"))
            .and(header("Authorization", "Splunk tok-123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let returner = ReturnerConfig {
            splunk: vec![splunk_for(&server)],
            index_extracted_fields: vec!["check_result".into()],
            ..Default::default()
        };
        let sink = HecSink::new(&returner, fixed(web1()), "web1").unwrap();
        let ret = audit_return();
        sink.deliver(&ret).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let sent = events(&requests[0]);
        assert_eq!(sent.len(), 4);

        let failure = &sent[0];
        assert_eq!(failure["host"], "web1.example.com");
        assert_eq!(failure["index"], "trubble");
        assert_eq!(failure["sourcetype"], "trubble_audit");
        assert_eq!(failure["fields"]["check_result"], "Failure");
        assert_eq!(failure["event"]["check_id"], "kernel_pinned");
        assert_eq!(failure["event"]["description"], "Kernel is pinned");
        assert_eq!(failure["event"]["job_id"], ret.jid.as_str());
        assert_eq!(failure["event"]["dest_ip"], "10.0.0.5");
        assert_eq!(failure["event"]["custom_site"], "dc1,dc2");
        assert!(failure["event"].get("detail").is_none());
        assert!(failure["event"].get("tags").is_none());

        assert_eq!(sent[1]["event"]["check_result"], "Success");
        assert_eq!(sent[2]["event"]["check_result"], "Controlled");
        assert_eq!(sent[3]["event"]["compliance_percentage"], 67);
        assert!(sent[3]["event"].get("check_id").is_none());
    }

    #[tokio::test]
    async fn test_other_functions_use_log_sourcetype() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let returner = ReturnerConfig {
            splunk: vec![splunk_for(&server)],
            ..Default::default()
        };
        let sink = HecSink::new(&returner, fixed(web1()), "web1").unwrap();
        let ret = JobReturn::new("web1", "conf.publish", json!({"agent": {"id": "web1"}}));
        sink.deliver(&ret).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let sent = events(&requests[0]);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["sourcetype"], "trubble_log");
        assert_eq!(sent[0]["event"]["return"]["agent"]["id"], "web1");
    }

    #[tokio::test]
    async fn test_identity_recaptured_per_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let deliveries = AtomicU32::new(0);
        let snapshots: Arc<dyn SnapshotSource> = Arc::new(move || {
            let n = deliveries.fetch_add(1, Ordering::SeqCst);
            web1().with_grain("ipv4", json!([format!("10.0.0.{}", n + 1)]))
        });
        let returner = ReturnerConfig {
            splunk: vec![splunk_for(&server)],
            ..Default::default()
        };
        let sink = HecSink::new(&returner, snapshots, "web1").unwrap();
        let ret = JobReturn::new("web1", "conf.publish", json!({}));
        sink.deliver(&ret).await.unwrap();
        sink.deliver(&ret).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(events(&requests[0])[0]["event"]["dest_ip"], "10.0.0.1");
        assert_eq!(events(&requests[1])[0]["event"]["dest_ip"], "10.0.0.2");
    }

    #[tokio::test]
    async fn test_dropins_reread_per_delivery() {
        let original = MockServer::start().await;
        let replacement = MockServer::start().await;
        for server in [&original, &replacement] {
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200))
                .mount(server)
                .await;
        }

        let dir = tempfile::tempdir().unwrap();
        let returner = ReturnerConfig {
            splunk: vec![splunk_for(&original)],
            ..Default::default()
        };
        let sink = HecSink::new(&returner, fixed(web1()), "web1")
            .unwrap()
            .with_dropin_dir(dir.path());
        let ret = JobReturn::new("web1", "conf.publish", json!({}));
        sink.deliver(&ret).await.unwrap();

        let dropin = format!(
            "trubblestack:\n  returner:\n    splunk:\n      token: tok-456\n      indexer: \"{}\"\n      port: {}\n      index: rotated\n      hec_ssl: false\n",
            replacement.address().ip(),
            replacement.address().port()
        );
        std::fs::write(dir.path().join("splunk.conf"), dropin).unwrap();
        sink.deliver(&ret).await.unwrap();

        assert_eq!(original.received_requests().await.unwrap().len(), 1);
        let requests = replacement.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(events(&requests[0])[0]["index"], "rotated");
    }

    #[tokio::test]
    async fn test_forward_logs_uses_log_sourcetype() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let returner = ReturnerConfig {
            splunk: vec![splunk_for(&server)],
            ..Default::default()
        };
        let sink = HecSink::new(&returner, fixed(web1()), "web1").unwrap();
        let mut record = Map::new();
        record.insert("message".into(), json!("Scheduler started"));
        record.insert("level".into(), json!("INFO"));

        sink.forward_logs(&[]).await.unwrap();
        sink.forward_logs(&[record]).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let sent = events(&requests[0]);
        assert_eq!(sent[0]["sourcetype"], "trubble_log");
        assert_eq!(sent[0]["event"]["message"], "Scheduler started");
        assert_eq!(sent[0]["event"]["minion_id"], "web1");
        assert_eq!(sent[0]["event"]["custom_site"], "dc1,dc2");
    }

    #[tokio::test]
    async fn test_retry_skips_collectors_that_accepted() {
        let healthy = MockServer::start().await;
        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&healthy)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&down)
            .await;

        let returner = ReturnerConfig {
            splunk: vec![splunk_for(&healthy), splunk_for(&down)],
            ..Default::default()
        };
        let sink = HecSink::new(&returner, fixed(web1()), "web1").unwrap();
        let ret = JobReturn::new("web1", "conf.publish", json!({})).with_retry(true);

        let result = sink.deliver_retrying(&ret, &quick_retries(2)).await;
        assert!(result.is_err());
        assert_eq!(healthy.received_requests().await.unwrap().len(), 1);
        assert_eq!(down.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_accepted_batches_not_resent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = splunk_for(&server);
        let mut collector = HecCollector::new(&config, &config.indexer)
            .unwrap()
            .with_max_bytes(100)
            .with_retry(quick_retries(3));

        for n in 0..2 {
            let mut payload = Map::new();
            payload.insert("event".into(), json!({"n": n, "pad": "x".repeat(60)}));
            collector.batch_event(payload).await.unwrap();
        }
        collector.flush().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let sent: Vec<Value> = requests.iter().map(|r| events(r)[0]["event"]["n"].clone()).collect();
        assert_eq!(sent, vec![json!(0), json!(1), json!(1)]);
    }

    #[tokio::test]
    async fn test_failover_to_next_server() {
        let down = MockServer::start().await;
        let up = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&down)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&up)
            .await;

        let mut config = splunk_for(&up);
        config.indexer = format!("{},{}", down.address(), up.address());
        let mut collector = HecCollector::new(&config, &config.indexer).unwrap();
        assert_eq!(collector.servers().len(), 2);

        collector.batch_event(Map::new()).await.unwrap();
        collector.flush().await.unwrap();
        assert_eq!(collector.pending(), 0);
    }

    #[tokio::test]
    async fn test_all_servers_failing() {
        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&down)
            .await;

        let config = splunk_for(&down);
        let mut collector = HecCollector::new(&config, &config.indexer).unwrap();
        collector.batch_event(Map::new()).await.unwrap();
        let err = collector.flush().await.unwrap_err();
        assert!(matches!(err, TransportError::AllServersFailed { attempted: 1, .. }));
    }

    #[tokio::test]
    async fn test_rejected_token_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let config = splunk_for(&server);
        let mut collector = HecCollector::new(&config, &config.indexer)
            .unwrap()
            .with_retry(quick_retries(3));
        collector.batch_event(Map::new()).await.unwrap();
        let err = collector.flush().await.unwrap_err();

        assert!(matches!(err, TransportError::Status { status: 403, .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_auto_flush_on_size() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = splunk_for(&server);
        let mut collector = HecCollector::new(&config, &config.indexer)
            .unwrap()
            .with_max_bytes(150);

        for i in 0..3 {
            let mut payload = Map::new();
            payload.insert("event".into(), json!({"n": i, "pad": "x".repeat(60)}));
            collector.batch_event(payload).await.unwrap();
        }
        collector.flush().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
        for request in &requests {
            assert_eq!(events(request).len(), 1);
        }
    }

    #[test]
    fn test_fallback_indexer_without_gateway() {
        let mut config = SplunkConfig::new("tok", "splunk.example.com", "trubble");
        config.fallback_indexer = Some("splunk.local".into());

        let isolated = AttributeSnapshot::new().with_grain("ip_gw", json!(false));
        assert_eq!(HecSink::indexer(&config, &isolated), "splunk.local");

        let routed = AttributeSnapshot::new().with_grain("ip_gw", json!(true));
        assert_eq!(HecSink::indexer(&config, &routed), "splunk.example.com");

        assert!(HecSink::new(&ReturnerConfig::default(), fixed(web1()), "web1").is_err());
    }

    #[test]
    fn test_collector_requires_token() {
        let config = SplunkConfig::new(" ", "splunk.example.com", "trubble");
        assert!(matches!(
            HecCollector::new(&config, &config.indexer),
            Err(TransportError::NotConfigured(_))
        ));
    }
}
