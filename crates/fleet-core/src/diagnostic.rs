use crate::error::FleetError;
use crate::model::RepoSpec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Warning,
    Error,
    Unreachable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Error => "error",
            HealthStatus::Unreachable => "unreachable",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkStatus {
    Ok,
    Timeout,
    Unreachable,
    AuthFailed,
    #[default]
    Skipped,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DivergenceType {
    #[default]
    None,
    Ahead,
    FastForward,
    Diverged,
    Conflict,
    NoUpstream,
}

impl DivergenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DivergenceType::None => "none",
            DivergenceType::Ahead => "ahead",
            DivergenceType::FastForward => "fast-forward",
            DivergenceType::Diverged => "diverged",
            DivergenceType::Conflict => "conflict",
            DivergenceType::NoUpstream => "no-upstream",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkTreeStatus {
    #[default]
    Clean,
    Dirty,
    Conflict,
}

/// Wall time spent in each step of one repo check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckTimings {
    #[serde(with = "duration_ms")]
    pub open: Duration,
    #[serde(with = "duration_ms")]
    pub branch: Duration,
    #[serde(with = "duration_ms")]
    pub fetch: Duration,
    #[serde(with = "duration_ms")]
    pub status: Duration,
    #[serde(with = "duration_ms")]
    pub total: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoHealth {
    pub repo: RepoSpec,
    pub status: HealthStatus,
    pub network: NetworkStatus,
    pub divergence: DivergenceType,
    pub work_tree: WorkTreeStatus,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    pub ahead: usize,
    pub behind: usize,
    pub modified: usize,
    pub staged: usize,
    pub untracked: usize,
    pub conflicts: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recommendation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timings: CheckTimings,
}

impl RepoHealth {
    pub fn changed_files(&self) -> usize {
        self.modified + self.staged + self.untracked
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub warning: usize,
    pub error: usize,
    pub unreachable: usize,
}

impl HealthSummary {
    pub fn tally(results: &[RepoHealth]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for health in results {
            match health.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Warning => summary.warning += 1,
                HealthStatus::Error => summary.error += 1,
                HealthStatus::Unreachable => summary.unreachable += 1,
            }
        }
        summary
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// One entry per input repo, in input order.
    pub results: Vec<RepoHealth>,
    pub summary: HealthSummary,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// RFC 3339.
    pub generated_at: String,
}

type HealthCallback = Box<dyn Fn(&RepoHealth, usize, usize)>;

pub struct DiagnosticOptions {
    pub skip_fetch: bool,
    /// Per-repo fetch deadline; zero means [`DEFAULT_FETCH_TIMEOUT`].
    pub fetch_timeout: Duration,
    pub parallelism: usize,
    pub check_work_tree: bool,
    pub recommendations: bool,
    /// Called on the collecting thread with `(result, done, total)`.
    pub progress: Option<HealthCallback>,
}

impl Default for DiagnosticOptions {
    fn default() -> Self {
        Self {
            skip_fetch: false,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            parallelism: crate::executor::DEFAULT_PARALLELISM,
            check_work_tree: true,
            recommendations: true,
            progress: None,
        }
    }
}

impl DiagnosticOptions {
    pub fn on_progress(mut self, callback: impl Fn(&RepoHealth, usize, usize) + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    pub(crate) fn effective_fetch_timeout(&self) -> Duration {
        if self.fetch_timeout.is_zero() {
            DEFAULT_FETCH_TIMEOUT
        } else {
            self.fetch_timeout
        }
    }

    pub(crate) fn workers(&self) -> usize {
        if self.parallelism == 0 {
            crate::executor::DEFAULT_PARALLELISM
        } else {
            self.parallelism
        }
    }
}

pub fn classify_divergence(
    upstream: Option<&str>,
    conflicts: usize,
    ahead: usize,
    behind: usize,
) -> DivergenceType {
    if upstream.is_none_or(str::is_empty) {
        return DivergenceType::NoUpstream;
    }
    if conflicts > 0 {
        return DivergenceType::Conflict;
    }
    match (ahead > 0, behind > 0) {
        (false, false) => DivergenceType::None,
        (true, true) => DivergenceType::Diverged,
        (false, true) => DivergenceType::FastForward,
        (true, false) => DivergenceType::Ahead,
    }
}

/// First match wins; the order is part of the contract.
pub fn classify_health(
    network: NetworkStatus,
    work_tree: WorkTreeStatus,
    divergence: DivergenceType,
    behind: usize,
) -> HealthStatus {
    if matches!(network, NetworkStatus::Timeout | NetworkStatus::Unreachable) {
        return HealthStatus::Unreachable;
    }
    if work_tree == WorkTreeStatus::Conflict {
        return HealthStatus::Error;
    }
    if work_tree == WorkTreeStatus::Dirty && behind > 0 {
        return HealthStatus::Error;
    }
    if matches!(
        divergence,
        DivergenceType::Diverged | DivergenceType::FastForward | DivergenceType::Ahead
    ) {
        return HealthStatus::Warning;
    }
    if work_tree == WorkTreeStatus::Dirty {
        return HealthStatus::Warning;
    }
    HealthStatus::Healthy
}

const UNREACHABLE_MARKERS: &[&str] = &[
    "could not resolve host",
    "connection refused",
    "network is unreachable",
];

const AUTH_MARKERS: &[&str] = &[
    "authentication failed",
    "permission denied",
    "could not read from remote",
];

/// Best-effort mapping of a fetch failure to a network status from git's
/// diagnostic text. Locale and git version can change the wording.
pub fn classify_network(error: Option<&anyhow::Error>, stderr: &str) -> NetworkStatus {
    let Some(error) = error else {
        return NetworkStatus::Ok;
    };
    let text = format!("{stderr}\n{error:#}").to_lowercase();
    if UNREACHABLE_MARKERS.iter().any(|marker| text.contains(marker)) {
        return NetworkStatus::Unreachable;
    }
    if AUTH_MARKERS.iter().any(|marker| text.contains(marker)) {
        return NetworkStatus::AuthFailed;
    }
    if FleetError::is_deadline(error) {
        return NetworkStatus::Timeout;
    }
    NetworkStatus::Unreachable
}

pub fn work_tree_status(conflicts: usize, changed: usize) -> WorkTreeStatus {
    if conflicts > 0 {
        WorkTreeStatus::Conflict
    } else if changed > 0 {
        WorkTreeStatus::Dirty
    } else {
        WorkTreeStatus::Clean
    }
}

/// Guidance keyed off the classification; counts and names are interpolated.
pub fn recommend(health: &RepoHealth) -> String {
    let upstream = health.upstream.as_deref().unwrap_or("upstream");
    let changed = health.changed_files();
    match health.status {
        HealthStatus::Unreachable => {
            return "check network connectivity and that the remote is reachable".to_string();
        }
        HealthStatus::Error if health.error.is_some() => {
            return "inspect the repository; git could not read its state".to_string();
        }
        _ => {}
    }
    if health.conflicts > 0 {
        return format!(
            "resolve merge conflicts in {} file(s), then commit",
            health.conflicts
        );
    }
    if health.work_tree == WorkTreeStatus::Dirty && health.behind > 0 {
        return format!(
            "commit or stash {changed} file(s), then pull {} commit(s)",
            health.behind
        );
    }
    match health.divergence {
        DivergenceType::Diverged => {
            return format!(
                "branch has diverged ({} ahead, {} behind); rebase onto {upstream} or merge it",
                health.ahead, health.behind
            );
        }
        DivergenceType::FastForward => {
            return format!("pull {} commit(s) from {upstream}", health.behind);
        }
        DivergenceType::Ahead => {
            return format!("push {} commit(s) to {upstream}", health.ahead);
        }
        _ => {}
    }
    if health.work_tree == WorkTreeStatus::Dirty {
        return format!("commit or stash {changed} changed file(s)");
    }
    if health.divergence == DivergenceType::NoUpstream {
        let branch = if health.branch.is_empty() {
            "<branch>"
        } else {
            health.branch.as_str()
        };
        return format!("set an upstream: git branch --set-upstream-to=origin/{branch} {branch}");
    }
    if health.network == NetworkStatus::AuthFailed {
        return "fetch was refused; check credentials (results use local data)".to_string();
    }
    "no action needed".to_string()
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
