//! Trubble Agent - Host-resident compliance auditing agent
//!
//! The agent runs locally on hosts and performs:
//! - Scheduled compliance audits (`nova.audit` / `nova.top`)
//! - Configuration publishing (`conf.publish`)
//! - Delivery of job results to returners (Splunk HTTP event collector, stdout)

mod functions;
mod grains;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Level};
use trubble_common::logging::{init_logging_with_layer, LogConfig, LogFormat};
use trubble_common::Config;
use trubble_core::{AttributeSnapshot, AuditReport, CheckResult, SnapshotSource};
use trubble_nova::{AuditEngine, AuditRequest, EngineSettings, FsProfileSource, ProbeRegistry};
use trubble_returner::{HecLogLayer, HecSink, RetryPolicy, SinkRegistry, StdoutSink};
use trubble_scheduler::{ScheduleJob, Scheduler, SchedulerSettings};

/// Trubble compliance agent
#[derive(Parser, Debug)]
#[command(name = "trubble-agent")]
#[command(author = "Trubble Stack Developers")]
#[command(version)]
#[command(about = "Host-resident compliance auditing agent", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "TRUBBLE_CONFIG")]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    log_level: Option<String>,

    /// Audit the given comma-separated profiles once and exit
    #[arg(long, value_name = "PROFILES")]
    audit: Option<String>,

    /// Audit everything the topfile selects once and exit
    #[arg(long, value_name = "TOPFILE", num_args = 0..=1)]
    top: Option<Option<String>>,

    /// Tag glob restricting which checks run with --audit
    #[arg(long, default_value = "*")]
    tags: String,

    /// Include profile, tags and details for every check
    #[arg(short, long)]
    verbose: bool,

    /// Output format for one-shot results (json, text)
    #[arg(long, default_value = "text")]
    format: String,

    /// Print the collected grains and exit
    #[arg(long)]
    grains: bool,
}

/// How often forwarded log records are shipped
const LOG_FORWARD_INTERVAL: Duration = Duration::from_secs(5);

fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        String::from("C:\\ProgramData\\Trubble\\agent.toml")
    }
    #[cfg(not(target_os = "windows"))]
    {
        String::from("/etc/trubble/agent.toml")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = if Path::new(&config_path).exists() {
        Config::from_file(&config_path)
            .with_context(|| format!("loading configuration from {}", config_path))?
    } else {
        Config::default()
    };
    let config = config.merge_env();
    let dropin_dir = Config::dropin_dir(&config_path);
    let one_shot = args.audit.is_some() || args.top.is_some() || args.grains;

    let hostname = grains::hostname();
    let snapshots = snapshot_source(&config, &hostname);

    let mut log_config = LogConfig::from_config(&config.logging);
    if let Some(level) = &args.log_level {
        log_config = log_config.level(level);
    }
    if one_shot {
        log_config = log_config.format(LogFormat::Compact).to_stderr();
    }

    let mut forwarding_note = None;
    let log_layer = if config.logging.splunk && !one_shot {
        match hec_sink(&config, &dropin_dir, &snapshots, &hostname) {
            Ok(Some(sink)) => {
                let (layer, _forwarder) =
                    HecLogLayer::spawn(Arc::new(sink), Level::INFO, LOG_FORWARD_INTERVAL);
                Some(layer)
            }
            Ok(None) => {
                forwarding_note = Some(String::from("no collectors configured"));
                None
            }
            Err(e) => {
                forwarding_note = Some(e.to_string());
                None
            }
        }
    } else {
        None
    };
    init_logging_with_layer(log_config, log_layer);
    if let Some(note) = forwarding_note {
        warn!("Splunk log forwarding disabled: {}", note);
    }

    info!("Trubble Agent v{}", env!("CARGO_PKG_VERSION"));
    info!("Platform: {} ({})", std::env::consts::OS, std::env::consts::ARCH);
    if Path::new(&config_path).exists() {
        info!("Loaded config from: {}", config_path);
    } else {
        debug!("Config file {} not found, using defaults", config_path);
    }

    if args.grains {
        let snapshot = capture(&snapshots).await?;
        println!("{}", serde_json::to_string_pretty(snapshot.grains())?);
        return Ok(());
    }

    let engine = Arc::new(build_engine(&config));

    if let Some(paths) = &args.audit {
        let request = AuditRequest::audit(AuditRequest::parse_paths(paths), args.tags.as_str())
            .with_verbose(args.verbose);
        return run_once(engine, snapshots, request, &args).await;
    }
    if let Some(topfile) = &args.top {
        let request = match topfile {
            Some(topfile) => AuditRequest::topfile(topfile.as_str()),
            None => AuditRequest::top(),
        }
        .with_verbose(args.verbose);
        return run_once(engine, snapshots, request, &args).await;
    }

    run_daemon(&config, &dropin_dir, engine, snapshots, &hostname).await
}

/// Grains are re-collected every time a run captures a snapshot
fn snapshot_source(config: &Config, hostname: &str) -> Arc<dyn SnapshotSource> {
    let config = config.clone();
    let hostname = hostname.to_string();
    Arc::new(move || build_snapshot(&config, &hostname))
}

async fn capture(snapshots: &Arc<dyn SnapshotSource>) -> Result<AttributeSnapshot> {
    let snapshots = Arc::clone(snapshots);
    tokio::task::spawn_blocking(move || snapshots.capture())
        .await
        .context("grain collection failed")
}

/// Collected grains overlaid with `[grains]`, plus `[pillar]`
fn build_snapshot(config: &Config, hostname: &str) -> AttributeSnapshot {
    let mut collected = grains::collect();
    collected.extend(config.grains.clone());

    let mut snapshot = AttributeSnapshot::from_maps(collected, config.pillar.clone());
    let id = config
        .agent
        .id
        .clone()
        .or_else(|| snapshot.grain_string("id"))
        .unwrap_or_else(|| hostname.to_string());
    snapshot.set_grain("id", id);
    snapshot
}

/// Splunk returner over the configured collectors, re-reading `trubble.d` drop-ins
///
/// `None` when neither the config file nor a drop-in names a collector.
fn hec_sink(
    config: &Config,
    dropin_dir: &Path,
    snapshots: &Arc<dyn SnapshotSource>,
    hostname: &str,
) -> Result<Option<HecSink>> {
    let returner = config.returner.with_dropins(dropin_dir);
    if returner.splunk.is_empty() {
        return Ok(None);
    }
    let sink = HecSink::new(&returner, Arc::clone(snapshots), hostname)
        .context("configuring splunk returner")?
        .with_dropin_dir(dropin_dir);
    Ok(Some(sink))
}

fn build_engine(config: &Config) -> AuditEngine {
    let source = FsProfileSource::new(&config.agent.file_root, config.agent.profile_dir.as_str());
    let settings = EngineSettings {
        nova_topfile: config.agent.nova_topfile.clone(),
        control_topfile: config.agent.control_topfile.clone(),
    };
    AuditEngine::new(
        Arc::new(source),
        Arc::new(ProbeRegistry::with_builtins()),
        settings,
    )
}

/// Run a single audit and print the report
async fn run_once(
    engine: Arc<AuditEngine>,
    snapshots: Arc<dyn SnapshotSource>,
    request: AuditRequest,
    args: &Args,
) -> Result<()> {
    info!("Running compliance audit...");
    let report = tokio::task::spawn_blocking(move || {
        let snapshot = snapshots.capture();
        engine.run(&request, &snapshot)
    })
    .await
    .context("audit task failed")?;

    match args.format.as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&report.render())?);
        }
        _ => print_report_text(&report, report.verbose),
    }

    if report.is_failed() {
        error!("Audit could not run");
        std::process::exit(2);
    }
    if !report.failures.is_empty() {
        warn!("{} checks failed", report.failures.len());
        std::process::exit(1);
    }
    Ok(())
}

fn print_report_text(report: &AuditReport, verbose: bool) {
    println!("\n=== Compliance Audit Results ===\n");

    let sections: [(&str, &[CheckResult]); 3] = [
        ("FAIL", report.failures.as_slice()),
        ("CTRL", report.controlled.as_slice()),
        ("PASS", report.successes.as_slice()),
    ];
    for (status, results) in sections {
        for r in results {
            println!("[{}] {} - {}", status, r.check_name, r.description);
            if verbose {
                println!("    Profile:  {}", r.profile);
                if !r.tags.is_empty() {
                    let tags: Vec<&str> = r.tags.iter().map(String::as_str).collect();
                    println!("    Tags:     {}", tags.join(", "));
                }
                if let Some(reason) = &r.reason {
                    println!("    Reason:   {}", reason);
                }
                if let Some(detail) = &r.detail {
                    println!("    Details:  {}", detail);
                }
                println!();
            }
        }
    }

    if !report.errors.is_empty() {
        println!("\nErrors:");
        for e in &report.errors {
            let location = match (&e.profile, &e.check) {
                (Some(p), Some(c)) => format!("{}:{}", p, c),
                (Some(p), None) => p.clone(),
                _ => String::from("-"),
            };
            println!("  [{}] {} {}", e.code, location, e.message);
        }
    }

    println!("\nSummary:");
    println!("  Total:      {}", report.total_checks());
    println!("  Passed:     {}", report.successes.len());
    println!("  Failed:     {}", report.failures.len());
    println!("  Controlled: {}", report.controlled.len());
    println!("  Errors:     {}", report.errors.len());
    match report.compliance_percent() {
        Some(percent) => println!("  Compliance: {}%", percent),
        None => println!("  Compliance: n/a"),
    }
}

/// Run the scheduler until interrupted
async fn run_daemon(
    config: &Config,
    dropin_dir: &Path,
    engine: Arc<AuditEngine>,
    snapshots: Arc<dyn SnapshotSource>,
    hostname: &str,
) -> Result<()> {
    info!("Starting agent daemon...");

    if config.schedule.is_empty() {
        error!("No jobs scheduled. Add [schedule.<name>] tables, or use --audit / --top for a single run.");
        anyhow::bail!("No jobs scheduled");
    }

    let functions = functions::registry(Arc::clone(&engine), Arc::clone(&snapshots), &config.to_json()?);

    let mut sinks = SinkRegistry::new();
    sinks.register(Arc::new(StdoutSink::new()));
    if let Some(hec) = hec_sink(config, dropin_dir, &snapshots, hostname)? {
        sinks.register(Arc::new(hec));
    }

    let jobs: Vec<ScheduleJob> = config
        .schedule
        .iter()
        .map(|(name, job)| ScheduleJob::from_config(name.as_str(), job))
        .collect();

    let startup = capture(&snapshots).await?;
    let minion_id = startup.id().unwrap_or(hostname).to_string();
    let settings = SchedulerSettings {
        minion_id: minion_id.clone(),
        max_workers: config.agent.max_workers,
        shutdown_grace: Duration::from_secs(config.agent.shutdown_grace_seconds),
        retry: RetryPolicy::from_config(&config.returner),
    };

    info!("Minion ID: {}", minion_id);
    info!("File root: {}", config.agent.file_root);
    info!("Returners: {}", sinks.names().join(", "));
    for job in &jobs {
        info!(
            job = %job.name,
            function = %job.function,
            every = job.interval.as_secs(),
            splay = job.splay.as_secs(),
            returner = job.returner.as_deref().unwrap_or("-"),
            "Scheduled job"
        );
    }

    let scheduler = Scheduler::new(jobs, functions, sinks, settings)?;

    info!("Agent daemon running. Press Ctrl+C to exit.");
    let report = scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received shutdown signal");
        })
        .await;

    info!(
        "Agent shutdown complete ({} fired, {} skipped, {} aborted)",
        report.fired, report.skipped, report.aborted
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use trubble_common::JobConfig;

    #[test]
    fn test_snapshot_id_precedence() {
        let config = Config::builder().grain("role", "db").build();
        let snapshot = build_snapshot(&config, "db7.example.com");
        assert_eq!(snapshot.id(), Some("db7.example.com"));
        assert_eq!(snapshot.grain_string("role").as_deref(), Some("db"));

        let config = Config::builder().id("db7").build();
        assert_eq!(build_snapshot(&config, "ignored").id(), Some("db7"));
    }

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["trubble-agent", "--top", "--format", "json"]);
        assert_eq!(args.top, Some(None));
        assert_eq!(args.format, "json");

        let args = Args::parse_from(["trubble-agent", "--audit", "cis.linux", "--tags", "CIS-5*", "-v"]);
        assert_eq!(args.audit.as_deref(), Some("cis.linux"));
        assert_eq!(args.tags, "CIS-5*");
        assert!(args.verbose);
    }

    #[tokio::test]
    async fn test_daemon_rejects_unknown_returner() {
        let config = Config::builder()
            .id("web1")
            .job("audit", {
                let mut job = JobConfig::new("nova.top", 60);
                job.returner = Some("nowhere".into());
                job
            })
            .build();
        let snapshots = snapshot_source(&config, "web1");
        let engine = Arc::new(build_engine(&config));

        let dropins = tempfile::tempdir().unwrap();
        let err = run_daemon(&config, dropins.path(), engine, snapshots, "web1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown returner"));
    }

    #[test]
    fn test_hec_sink_from_dropins() {
        let config = Config::builder().id("web1").build();
        let snapshots = snapshot_source(&config, "web1");
        let dir = tempfile::tempdir().unwrap();
        assert!(hec_sink(&config, dir.path(), &snapshots, "web1").unwrap().is_none());

        std::fs::write(
            dir.path().join("splunk.conf"),
            "trubblestack:\n  returner:\n    splunk:\n      token: TOKEN\n      indexer: splunk.example.com\n      index: trubble\n",
        )
        .unwrap();
        assert!(hec_sink(&config, dir.path(), &snapshots, "web1").unwrap().is_some());
    }
}
