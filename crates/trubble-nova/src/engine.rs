//! Audit engine - one audit run from request to report
//!
//! A run moves through
//! `Idle → ResolvingTargets → LoadingProfiles → Executing → Reconciling → Done`
//! and may end in `Failed` from any stage when its top-level input is unusable.
//! Problems confined to one profile or check are recorded in the report and the
//! run continues.

use crate::control::{ControlProfile, ControlReconciler, ControlSet};
use crate::executor::{CheckExecutor, ProbeRegistry};
use crate::glob::TagFilter;
use crate::profile::Profile;
use crate::source::ProfileSource;
use crate::topfile::{Namespace, ProfileRef, Topfile};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use trubble_core::{AttributeSnapshot, AuditReport, Error, ReportError, Result};

/// Default nova topfile, relative to the file root
pub const DEFAULT_NOVA_TOPFILE: &str = "trubblestack_nova/top.nova";
/// Default control topfile, relative to the file root
pub const DEFAULT_CONTROL_TOPFILE: &str = "trubblestack_nova/top.control";

/// Stage of an audit run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    ResolvingTargets,
    LoadingProfiles,
    Executing,
    Reconciling,
    Done,
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::ResolvingTargets => "resolving_targets",
            EngineState::LoadingProfiles => "loading_profiles",
            EngineState::Executing => "executing",
            EngineState::Reconciling => "reconciling",
            EngineState::Done => "done",
            EngineState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Done | EngineState::Failed)
    }

    /// Whether `next` may follow this state
    pub fn can_transition_to(&self, next: EngineState) -> bool {
        use EngineState::*;
        match (self, next) {
            (Idle, ResolvingTargets)
            | (ResolvingTargets, LoadingProfiles)
            | (LoadingProfiles, Executing)
            | (Executing, Reconciling)
            | (Reconciling, Done) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to audit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRequest {
    /// Explicit profile paths; `None` resolves the nova topfile
    pub paths: Option<Vec<String>>,
    /// Tag glob applied to every check; `*` selects all
    pub tags: String,
    /// Render verbose result items
    pub verbose: bool,
    /// Topfile overriding the configured default
    pub topfile: Option<String>,
}

impl Default for AuditRequest {
    fn default() -> Self {
        Self {
            paths: None,
            tags: String::from("*"),
            verbose: false,
            topfile: None,
        }
    }
}

impl AuditRequest {
    /// Run the default topfile
    pub fn top() -> Self {
        Self::default()
    }

    /// Run a specific topfile
    pub fn topfile(topfile: impl Into<String>) -> Self {
        Self {
            topfile: Some(topfile.into()),
            ..Self::default()
        }
    }

    /// Run explicit profiles restricted to a tag glob
    pub fn audit(paths: Vec<String>, tags: impl Into<String>) -> Self {
        Self {
            paths: if paths.is_empty() { None } else { Some(paths) },
            tags: tags.into(),
            ..Self::default()
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Split a comma-separated profile list
    pub fn parse_paths(paths: &str) -> Vec<String> {
        paths
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// The request's tag filter; `None` when it selects everything
    pub fn tag_filter(&self) -> Result<Option<TagFilter>> {
        let tags = self.tags.trim();
        if tags.is_empty() || tags == "*" {
            Ok(None)
        } else {
            TagFilter::parse(tags).map(Some)
        }
    }
}

/// Topfile locations relative to the profile source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub nova_topfile: String,
    pub control_topfile: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            nova_topfile: DEFAULT_NOVA_TOPFILE.to_string(),
            control_topfile: DEFAULT_CONTROL_TOPFILE.to_string(),
        }
    }
}

/// Runs audits against a profile source
pub struct AuditEngine {
    source: Arc<dyn ProfileSource>,
    executor: CheckExecutor,
    settings: EngineSettings,
}

impl AuditEngine {
    pub fn new(
        source: Arc<dyn ProfileSource>,
        probes: Arc<ProbeRegistry>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            source,
            executor: CheckExecutor::new(probes),
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Audit explicit profiles (comma-separated), or the default topfile when none are given
    pub fn audit(
        &self,
        paths: Option<&str>,
        tags: &str,
        verbose: bool,
        snapshot: &AttributeSnapshot,
    ) -> AuditReport {
        let paths = paths.map(AuditRequest::parse_paths).unwrap_or_default();
        let request = AuditRequest::audit(paths, tags).with_verbose(verbose);
        self.run(&request, snapshot)
    }

    /// Audit everything a topfile selects for this host
    pub fn top(&self, topfile: Option<&str>, snapshot: &AttributeSnapshot) -> AuditReport {
        let request = match topfile {
            Some(topfile) => AuditRequest::topfile(topfile),
            None => AuditRequest::top(),
        };
        self.run(&request, snapshot)
    }

    /// Execute one audit run
    pub fn run(&self, request: &AuditRequest, snapshot: &AttributeSnapshot) -> AuditReport {
        let mut run = AuditRun::new();
        info!(
            host = snapshot.id().unwrap_or("unknown"),
            tags = %request.tags,
            "Starting audit"
        );

        match self.drive(&mut run, request, snapshot) {
            Ok(report) => {
                info!(
                    successes = report.successes.len(),
                    failures = report.failures.len(),
                    controlled = report.controlled.len(),
                    errors = report.errors.len(),
                    compliance = ?report.compliance_percent(),
                    "Audit complete"
                );
                report.with_verbose(request.verbose)
            }
            Err(e) => {
                if e.is_fatal() {
                    warn!(stage = %run.state, error = %e, "Audit failed on unusable input");
                } else {
                    error!(stage = %run.state, code = e.code(), error = %e, "Audit aborted");
                }
                run.fail();
                AuditReport::failed(&e).with_verbose(request.verbose)
            }
        }
    }

    fn drive(
        &self,
        run: &mut AuditRun,
        request: &AuditRequest,
        snapshot: &AttributeSnapshot,
    ) -> Result<AuditReport> {
        run.advance(EngineState::ResolvingTargets)?;
        let request_filter = request.tag_filter()?;
        let targets = match &request.paths {
            Some(paths) => self.explicit_targets(run, paths, &request_filter),
            None => {
                let topfile = request
                    .topfile
                    .as_deref()
                    .unwrap_or(&self.settings.nova_topfile);
                self.resolve_topfile(run, topfile, snapshot)?
            }
        };
        let controls = self.resolve_controls(run, snapshot)?;
        debug!(
            profiles = targets.len(),
            controls = controls.len(),
            "Targets resolved"
        );

        run.advance(EngineState::LoadingProfiles)?;
        let mut loaded = Vec::with_capacity(targets.len());
        for target in targets {
            match self.load_profile(&target.path) {
                Ok(profile) => loaded.push((target, profile)),
                Err(e) => {
                    warn!(profile = %target.path, error = %e, "Skipping profile");
                    run.errors.push(ReportError::for_profile(&target.path, &e));
                }
            }
        }

        run.advance(EngineState::Executing)?;
        let mut results = Vec::new();
        for (target, profile) in &loaded {
            let selected = profile
                .selected(target.tag_filter.as_ref())
                .filter(|check| {
                    request_filter
                        .as_ref()
                        .map_or(true, |f| f.matches_any(&check.tags))
                });
            for check in selected {
                results.push(self.executor.execute(check, &profile.path, snapshot));
            }
        }

        run.advance(EngineState::Reconciling)?;
        let results = ControlReconciler::new(controls).reconcile(results);

        run.advance(EngineState::Done)?;
        Ok(AuditReport::from_results(results, std::mem::take(&mut run.errors)))
    }

    /// Explicit paths bypass the nova topfile and carry the request filter
    fn explicit_targets(
        &self,
        run: &mut AuditRun,
        paths: &[String],
        filter: &Option<TagFilter>,
    ) -> Vec<ProfileRef> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        for path in paths {
            match self.source.expand(path) {
                Ok(expanded) => {
                    for profile in expanded {
                        if seen.insert(profile.clone()) {
                            targets.push(ProfileRef::new(profile, filter.clone()));
                        }
                    }
                }
                Err(e) => run.errors.push(ReportError::for_profile(path, &e)),
            }
        }
        targets
    }

    /// A missing or malformed nova topfile fails the run
    fn resolve_topfile(
        &self,
        run: &mut AuditRun,
        topfile: &str,
        snapshot: &AttributeSnapshot,
    ) -> Result<Vec<ProfileRef>> {
        let content = self
            .source
            .read_topfile(topfile)?
            .ok_or_else(|| Error::Config(format!("Topfile not found: {}", topfile)))?;
        let refs = Topfile::parse(&content)?.resolve(Namespace::Nova, snapshot)?;

        let mut targets: Vec<ProfileRef> = Vec::with_capacity(refs.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for profile_ref in refs {
            match self.source.expand(&profile_ref.path) {
                Ok(expanded) => {
                    for path in expanded {
                        let target = ProfileRef::new(path, profile_ref.tag_filter.clone());
                        match positions.get(&target.path) {
                            Some(&idx) => targets[idx].merge(&target),
                            None => {
                                positions.insert(target.path.clone(), targets.len());
                                targets.push(target);
                            }
                        }
                    }
                }
                Err(e) => run
                    .errors
                    .push(ReportError::for_profile(&profile_ref.path, &e)),
            }
        }
        Ok(targets)
    }

    /// An absent control topfile means no controls
    fn resolve_controls(&self, run: &mut AuditRun, snapshot: &AttributeSnapshot) -> Result<ControlSet> {
        let content = match self.source.read_topfile(&self.settings.control_topfile)? {
            Some(content) => content,
            None => return Ok(ControlSet::new()),
        };
        let refs = Topfile::parse(&content)?.resolve(Namespace::Control, snapshot)?;

        let mut profiles = Vec::with_capacity(refs.len());
        for profile_ref in refs {
            let loaded = self
                .source
                .read_profile(&profile_ref.path)
                .and_then(|content| ControlProfile::parse(&profile_ref.path, &content));
            match loaded {
                Ok(profile) => profiles.push(profile),
                Err(e) => {
                    warn!(profile = %profile_ref.path, error = %e, "Skipping control profile");
                    run.errors
                        .push(ReportError::for_profile(&profile_ref.path, &e));
                }
            }
        }
        Ok(ControlSet::from_profiles(&profiles))
    }

    fn load_profile(&self, path: &str) -> Result<Profile> {
        let content = self.source.read_profile(path)?;
        Profile::load(path, &content)
    }
}

/// Mutable state of one run
struct AuditRun {
    state: EngineState,
    errors: Vec<ReportError>,
}

impl AuditRun {
    fn new() -> Self {
        Self {
            state: EngineState::Idle,
            errors: Vec::new(),
        }
    }

    fn advance(&mut self, next: EngineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "invalid audit transition {} -> {}",
                self.state, next
            )));
        }
        debug!("Audit state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            debug!("Audit state {} -> {}", self.state, EngineState::Failed);
            self.state = EngineState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::FsProfileSource;
    use std::fs;
    use tempfile::TempDir;
    use trubble_core::{Outcome, RunState};

    const TOP_NOVA: &str = r#"
nova:
  '*':
    - cis.linux
  'web*':
    - stig.web: 'V-*'
  'db*':
    - cis.database
"#;

    const TOP_CONTROL: &str = r#"
control:
  '*':
    - controls.base
"#;

    const CIS_LINUX: &str = r#"
os_supported:
  description: Supported operating system
  tags: [CIS-1]
  trigger: {type: grain, grain: os, pattern: Ubuntu}
legacy_os:
  description: Legacy platform check
  tags: [CIS-2]
  trigger: {type: grain, grain: os, pattern: RedHat}
kernel_pinned:
  description: Kernel is pinned
  tags: [CIS-3]
  trigger: {type: grain, grain: kernelrelease, pattern: '5.*'}
telnet_absent:
  description: Telnet is absent
  tags: [CIS-4]
  control: Telnet blocked at the edge
  trigger: {type: no_such_probe}
custom_probe:
  description: Unregistered probe
  tags: [CIS-5]
  trigger: {type: no_such_probe}
"#;

    const STIG_WEB: &str = r#"
web_role:
  description: Web role assigned
  tags: [V-100]
  trigger: {type: grain, grain: roles, pattern: web}
unrelated:
  description: Filtered out by the topfile
  tags: [X-1]
  trigger: {type: grain, grain: os, pattern: '*'}
"#;

    const CONTROLS: &str = "control:\n  - CIS-2: Legacy hosts are isolated\n";

    fn file_root() -> TempDir {
        let dir = TempDir::new().unwrap();
        let nova = dir.path().join("trubblestack_nova");
        let profiles = dir.path().join("profiles");
        fs::create_dir_all(&nova).unwrap();
        fs::create_dir_all(profiles.join("cis")).unwrap();
        fs::create_dir_all(profiles.join("stig")).unwrap();
        fs::create_dir_all(profiles.join("controls")).unwrap();

        fs::write(nova.join("top.nova"), TOP_NOVA).unwrap();
        fs::write(nova.join("top.control"), TOP_CONTROL).unwrap();
        fs::write(profiles.join("cis/linux.yaml"), CIS_LINUX).unwrap();
        fs::write(profiles.join("stig/web.yaml"), STIG_WEB).unwrap();
        fs::write(profiles.join("controls/base.yaml"), CONTROLS).unwrap();
        dir
    }

    fn engine(root: &TempDir) -> AuditEngine {
        AuditEngine::new(
            Arc::new(FsProfileSource::new(root.path(), "profiles")),
            Arc::new(ProbeRegistry::with_builtins()),
            EngineSettings::default(),
        )
    }

    fn web1() -> AttributeSnapshot {
        AttributeSnapshot::new()
            .with_grain("id", "web1")
            .with_grain("os", "Ubuntu")
            .with_grain("kernelrelease", "6.1.0")
            .with_grain("roles", serde_json::json!(["web", "app"]))
    }

    fn names(results: &[trubble_core::CheckResult]) -> Vec<&str> {
        results.iter().map(|r| r.check_name.as_str()).collect()
    }

    #[test]
    fn test_top_run() {
        let root = file_root();
        let report = engine(&root).top(None, &web1());

        assert_eq!(report.state, RunState::Done);
        assert_eq!(names(&report.successes), vec!["os_supported", "web_role"]);
        assert_eq!(names(&report.failures), vec!["kernel_pinned"]);
        assert_eq!(names(&report.controlled), vec!["legacy_os", "telnet_absent"]);
        assert_eq!(
            report.controlled[0].reason.as_deref(),
            Some("Legacy hosts are isolated")
        );
        assert_eq!(
            report.controlled[1].reason.as_deref(),
            Some("Telnet blocked at the edge")
        );

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].check.as_deref(), Some("custom_probe"));
        assert_eq!(report.compliance, Some(0.8));
    }

    #[test]
    fn test_explicit_paths_skip_topfile_but_keep_controls() {
        let root = file_root();
        let report = engine(&root).audit(Some("cis.linux"), "CIS-[23]", false, &web1());

        assert_eq!(report.state, RunState::Done);
        assert!(report.successes.is_empty());
        assert_eq!(names(&report.failures), vec!["kernel_pinned"]);
        assert_eq!(names(&report.controlled), vec!["legacy_os"]);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_directory_path_expands() {
        let root = file_root();
        let report = engine(&root).audit(Some("stig"), "*", false, &web1());
        assert_eq!(names(&report.successes), vec!["web_role", "unrelated"]);
    }

    #[test]
    fn test_unfiltered_path_wins_over_filtered_directory() {
        let root = file_root();
        fs::write(
            root.path().join("trubblestack_nova/top.nova"),
            "nova:\n  '*':\n    - cis: 'CIS-1'\n  'web*':\n    - cis.linux\n",
        )
        .unwrap();
        let report = engine(&root).top(None, &web1());

        assert_eq!(report.total_checks(), 4);
        assert_eq!(names(&report.failures), vec!["kernel_pinned"]);
        assert_eq!(report.errors.len(), 1);
    }

    #[test]
    fn test_directory_filters_union_with_path_filters() {
        let root = file_root();
        fs::write(
            root.path().join("trubblestack_nova/top.nova"),
            "nova:\n  '*':\n    - cis: 'CIS-1'\n  'web*':\n    - cis.linux: 'CIS-3'\n",
        )
        .unwrap();
        let report = engine(&root).top(None, &web1());

        assert_eq!(names(&report.successes), vec!["os_supported"]);
        assert_eq!(names(&report.failures), vec!["kernel_pinned"]);
        assert_eq!(report.total_checks(), 2);
    }

    #[test]
    fn test_audit_carries_verbose_flag() {
        let root = file_root();
        let report = engine(&root).audit(Some("stig.web"), "V-*", true, &web1());
        assert!(report.verbose);
        assert_eq!(report.render()["Success"][0]["web_role"]["profile"], "stig.web");

        let terse = engine(&root).audit(Some("stig.web"), "V-*", false, &web1());
        assert_eq!(terse.render()["Success"][0]["web_role"], "Web role assigned");
    }

    #[test]
    fn test_request_tags_narrow_topfile_filters() {
        let root = file_root();
        let request = AuditRequest {
            tags: String::from("V-*"),
            ..AuditRequest::top()
        };
        let report = engine(&root).run(&request, &web1());
        assert_eq!(names(&report.successes), vec!["web_role"]);
        assert_eq!(report.total_checks(), 1);
    }

    #[test]
    fn test_missing_profile_is_not_fatal() {
        let root = file_root();
        let snapshot = web1().with_grain("id", "db1");
        let report = engine(&root).top(None, &snapshot);

        assert_eq!(report.state, RunState::Done);
        let missing = report
            .errors
            .iter()
            .find(|e| e.profile.as_deref() == Some("cis.database"))
            .unwrap();
        assert_eq!(missing.code, "PROFILE_NOT_FOUND");
        assert!(!report.successes.is_empty());
    }

    #[test]
    fn test_malformed_profile_is_recorded() {
        let root = file_root();
        fs::write(root.path().join("profiles/cis/broken.yaml"), "check: [1, 2]\n").unwrap();
        let report = engine(&root).audit(Some("cis.broken,stig.web"), "*", false, &web1());

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, "PROFILE_FORMAT");
        assert_eq!(report.successes.len(), 2);
    }

    #[test]
    fn test_malformed_topfile_fails_run() {
        let root = file_root();
        fs::write(
            root.path().join("trubblestack_nova/top.nova"),
            "nova:\n  'web* or db*':\n    - cis.linux\n",
        )
        .unwrap();
        let report = engine(&root).top(None, &web1());

        assert!(report.is_failed());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].code, "CONFIG_ERROR");
        assert!(report.successes.is_empty() && report.failures.is_empty());
        assert_eq!(report.compliance, None);
    }

    #[test]
    fn test_missing_topfile_fails_run() {
        let root = file_root();
        let report = engine(&root).top(Some("trubblestack_nova/other.nova"), &web1());
        assert!(report.is_failed());
    }

    #[test]
    fn test_absent_control_topfile_means_no_controls() {
        let root = file_root();
        fs::remove_file(root.path().join("trubblestack_nova/top.control")).unwrap();
        let report = engine(&root).audit(Some("cis.linux"), "CIS-2", false, &web1());

        assert_eq!(names(&report.failures), vec!["legacy_os"]);
        assert_eq!(report.failures[0].outcome, Outcome::Failure);
        assert_eq!(report.compliance, Some(0.0));
    }

    #[test]
    fn test_state_transitions() {
        use EngineState::*;
        assert!(Idle.can_transition_to(ResolvingTargets));
        assert!(Reconciling.can_transition_to(Done));
        assert!(Executing.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Executing));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(ResolvingTargets));
    }

    #[test]
    fn test_parse_paths() {
        assert_eq!(
            AuditRequest::parse_paths("cis.linux, stig.web,,"),
            vec!["cis.linux", "stig.web"]
        );
        assert_eq!(AuditRequest::audit(vec![], "*").paths, None);
        assert_eq!(AuditRequest::top().tag_filter().unwrap(), None);
    }
}
