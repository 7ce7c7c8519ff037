//! Configuration management for the Trubble agent

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use trubble_core::{Error, Result};

/// Directory, next to the main config file, holding returner drop-ins
pub const DROPIN_DIR: &str = "trubble.d";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Agent settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Static grains merged over the collected ones
    #[serde(default)]
    pub grains: BTreeMap<String, Value>,

    /// Operator-supplied pillar data
    #[serde(default)]
    pub pillar: BTreeMap<String, Value>,

    /// Recurring jobs, keyed by job name
    #[serde(default)]
    pub schedule: BTreeMap<String, JobConfig>,

    /// Returner (delivery sink) settings
    #[serde(default)]
    pub returner: ReturnerConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Create a configuration builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> Result<()> {
        for (name, job) in &self.schedule {
            if job.function.trim().is_empty() {
                return Err(Error::MissingConfig {
                    key: format!("schedule.{}.function", name),
                });
            }
            if job.seconds == 0 {
                return Err(Error::Config(format!(
                    "schedule.{}.seconds must be greater than zero",
                    name
                )));
            }
        }
        if self.agent.max_workers == 0 {
            return Err(Error::Config("agent.max_workers must be at least 1".into()));
        }
        Ok(())
    }

    /// Merge with environment variables (TRUBBLE_ prefix)
    pub fn merge_env(mut self) -> Self {
        if let Ok(val) = std::env::var("TRUBBLE_ID") {
            self.agent.id = Some(val);
        }
        if let Ok(val) = std::env::var("TRUBBLE_FILE_ROOT") {
            self.agent.file_root = val;
        }
        if let Ok(val) = std::env::var("TRUBBLE_MAX_WORKERS") {
            if let Ok(n) = val.parse() {
                self.agent.max_workers = n;
            }
        }

        // Logging
        if let Ok(val) = std::env::var("TRUBBLE_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("TRUBBLE_LOG_FORMAT") {
            self.logging.format = val;
        }

        self
    }

    /// Drop-in directory belonging to a config file path
    pub fn dropin_dir(config_path: impl AsRef<Path>) -> PathBuf {
        config_path
            .as_ref()
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(DROPIN_DIR)
    }

    /// Configuration as a JSON document (used by `conf.publish`)
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Minion id; defaults to the host name
    pub id: Option<String>,

    /// Master this agent reports under (falls back to the local host name)
    pub master: Option<String>,

    /// Local root holding topfiles and profiles
    #[serde(default = "default_file_root")]
    pub file_root: String,

    /// Profile directory, relative to `file_root`
    #[serde(default = "default_profile_dir")]
    pub profile_dir: String,

    /// Default nova topfile, relative to `file_root`
    #[serde(default = "default_nova_topfile")]
    pub nova_topfile: String,

    /// Control topfile, relative to `file_root`
    #[serde(default = "default_control_topfile")]
    pub control_topfile: String,

    /// Maximum jobs executing at once
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Seconds in-flight jobs get to finish on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,
}

fn default_file_root() -> String {
    #[cfg(target_os = "windows")]
    {
        String::from("C:\\ProgramData\\Trubble\\files")
    }
    #[cfg(not(target_os = "windows"))]
    {
        String::from("/var/cache/trubble/files")
    }
}

fn default_profile_dir() -> String {
    String::from("trubblestack_nova_profiles")
}

fn default_nova_topfile() -> String {
    String::from("trubblestack_nova/top.nova")
}

fn default_control_topfile() -> String {
    String::from("trubblestack_nova/top.control")
}

fn default_max_workers() -> usize {
    4
}

fn default_shutdown_grace() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: None,
            master: None,
            file_root: default_file_root(),
            profile_dir: default_profile_dir(),
            nova_topfile: default_nova_topfile(),
            control_topfile: default_control_topfile(),
            max_workers: default_max_workers(),
            shutdown_grace_seconds: default_shutdown_grace(),
        }
    }
}

/// A recurring job definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Registered function name (e.g. `nova.top`)
    pub function: String,

    /// Interval between fires
    pub seconds: u64,

    /// Maximum random delay added to every interval (0 = none)
    #[serde(default)]
    pub splay: u64,

    #[serde(default)]
    pub args: Vec<Value>,

    #[serde(default)]
    pub kwargs: Map<String, Value>,

    /// Returner receiving the job output
    pub returner: Option<String>,

    /// Retry failed deliveries
    #[serde(default)]
    pub returner_retry: bool,

    /// Fire once as soon as the scheduler starts
    #[serde(default)]
    pub run_on_start: bool,
}

impl JobConfig {
    pub fn new(function: impl Into<String>, seconds: u64) -> Self {
        Self {
            function: function.into(),
            seconds,
            splay: 0,
            args: Vec::new(),
            kwargs: Map::new(),
            returner: None,
            returner_retry: false,
            run_on_start: false,
        }
    }
}

/// Returner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnerConfig {
    /// Splunk HTTP event collector endpoints
    #[serde(default)]
    pub splunk: Vec<SplunkConfig>,

    /// Event keys copied into index-time `fields`
    #[serde(default)]
    pub index_extracted_fields: Vec<String>,

    /// Retries for jobs with `returner_retry`
    #[serde(default = "default_retry_max")]
    pub returner_retry_max: u32,

    /// Initial delay between retries, doubled after each attempt
    #[serde(default = "default_retry_sleep")]
    pub returner_retry_sleep: u64,
}

fn default_retry_max() -> u32 {
    3
}

fn default_retry_sleep() -> u64 {
    15
}

impl ReturnerConfig {
    /// Apply `*.conf` drop-ins found under `dir`
    ///
    /// Each drop-in is a YAML document; the last file (in path order)
    /// carrying `trubblestack.returner.splunk` replaces the collector list.
    /// Unreadable or malformed files are skipped.
    pub fn with_dropins(&self, dir: &Path) -> Self {
        let mut resolved = self.clone();
        let mut files = Vec::new();
        collect_dropins(dir, &mut files);
        files.sort();

        for file in files {
            match read_dropin(&file) {
                Ok(Some(splunk)) => {
                    debug!(file = %file.display(), collectors = splunk.len(), "Using returner drop-in");
                    resolved.splunk = splunk;
                }
                Ok(None) => {}
                Err(e) => warn!(file = %file.display(), error = %e, "Skipping returner drop-in"),
            }
        }
        resolved
    }
}

#[derive(Deserialize)]
struct DropIn {
    #[serde(default)]
    trubblestack: Option<DropInStack>,
}

#[derive(Deserialize)]
struct DropInStack {
    #[serde(default)]
    returner: Option<DropInReturner>,
}

#[derive(Deserialize)]
struct DropInReturner {
    #[serde(default)]
    splunk: Option<OneOrMany>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<SplunkConfig>),
    One(SplunkConfig),
}

fn collect_dropins(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_dropins(&path, files);
        } else if path.extension().is_some_and(|ext| ext == "conf") {
            files.push(path);
        }
    }
}

fn read_dropin(path: &Path) -> Result<Option<Vec<SplunkConfig>>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {:?}: {}", path, e)))?;
    let dropin: DropIn = serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {:?}: {}", path, e)))?;
    Ok(dropin
        .trubblestack
        .and_then(|stack| stack.returner)
        .and_then(|returner| returner.splunk)
        .map(|splunk| match splunk {
            OneOrMany::Many(list) => list,
            OneOrMany::One(one) => vec![one],
        }))
}

impl Default for ReturnerConfig {
    fn default() -> Self {
        Self {
            splunk: Vec::new(),
            index_extracted_fields: Vec::new(),
            returner_retry_max: default_retry_max(),
            returner_retry_sleep: default_retry_sleep(),
        }
    }
}

/// One Splunk HTTP event collector endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplunkConfig {
    pub token: String,
    pub indexer: String,

    #[serde(default = "default_hec_port")]
    pub port: u16,

    pub index: String,

    #[serde(default = "default_sourcetype_nova")]
    pub sourcetype_nova: String,

    #[serde(default = "default_sourcetype_log")]
    pub sourcetype_log: String,

    /// Use https
    #[serde(default = "default_true")]
    pub hec_ssl: bool,

    #[serde(default = "default_true")]
    pub http_event_collector_ssl_verify: bool,

    /// Proxy host:port
    pub proxy: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_hec_timeout")]
    pub timeout: f64,

    /// Attribute keys added to every event as `custom_<key>`
    #[serde(default)]
    pub custom_fields: Vec<String>,

    /// Indexer used when the host has no default gateway
    pub fallback_indexer: Option<String>,
}

fn default_hec_port() -> u16 {
    8088
}

fn default_sourcetype_nova() -> String {
    String::from("trubble_audit")
}

fn default_sourcetype_log() -> String {
    String::from("trubble_log")
}

fn default_hec_timeout() -> f64 {
    9.05
}

fn default_true() -> bool {
    true
}

impl SplunkConfig {
    pub fn new(token: impl Into<String>, indexer: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            indexer: indexer.into(),
            port: default_hec_port(),
            index: index.into(),
            sourcetype_nova: default_sourcetype_nova(),
            sourcetype_log: default_sourcetype_log(),
            hec_ssl: true,
            http_event_collector_ssl_verify: true,
            proxy: None,
            timeout: default_hec_timeout(),
            custom_fields: Vec::new(),
            fallback_indexer: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Forward the agent's own log records to the Splunk collectors
    #[serde(default)]
    pub splunk: bool,
}

fn default_log_level() -> String {
    String::from("info")
}

fn default_log_format() -> String {
    String::from("pretty")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            splunk: false,
        }
    }
}

/// Builder for constructing Config
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.agent.id = Some(id.into());
        self
    }

    pub fn file_root(mut self, root: impl Into<String>) -> Self {
        self.config.agent.file_root = root.into();
        self
    }

    pub fn grain(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.grains.insert(key.into(), value.into());
        self
    }

    pub fn job(mut self, name: impl Into<String>, job: JobConfig) -> Self {
        self.config.schedule.insert(name.into(), job);
        self
    }

    pub fn splunk(mut self, splunk: SplunkConfig) -> Self {
        self.config.returner.splunk.push(splunk);
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
