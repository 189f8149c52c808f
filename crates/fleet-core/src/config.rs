use crate::auth::expand_home;
use crate::diagnostic::{DEFAULT_FETCH_TIMEOUT, DiagnosticOptions};
use crate::executor::{
    DEFAULT_MAX_RETRIES, DEFAULT_PARALLELISM, DEFAULT_RETRY_BACKOFF, RunOptions, duration_secs,
};
use crate::model::{RepoSpec, Strategy};
use crate::paths::{PathLayout, repo_path};
use crate::planner::{PlanOptions, PlanRequest};
use crate::planner_forge::{ForgeFilter, ForgeTarget};
use anyhow::Context;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "repo-fleet";
const APPLICATION: &str = "repo-fleet";

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Base directory for repos without an explicit path, and for relative paths.
    pub root: Option<PathBuf>,
    /// Layout used to place repos that omit `path`.
    pub layout: PathLayout,
    pub repos: Vec<RepoSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forge: Option<ForgeSource>,
    pub defaults: SyncDefaults,
    pub cleanup: CleanupConfig,
    pub health: HealthConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncDefaults {
    pub strategy: Strategy,
    pub parallelism: usize,
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_backoff: Duration,
    pub strict_branch: bool,
}

impl Default for SyncDefaults {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            parallelism: DEFAULT_PARALLELISM,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            strict_branch: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Empty means the configured root.
    pub roots: Vec<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "duration_secs")]
    pub fetch_timeout: Duration,
    pub parallelism: usize,
    pub skip_fetch: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            parallelism: DEFAULT_PARALLELISM,
            skip_fetch: false,
        }
    }
}

/// A hosting-platform listing that replaces the static repo list. Entries in
/// `repos` then act as per-repo overrides.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForgeSource {
    /// `github` or `gitlab`.
    pub provider: String,
    pub target: ForgeTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API and clone token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
    #[serde(default)]
    pub use_ssh: bool,
    #[serde(default)]
    pub layout: PathLayout,
    #[serde(default)]
    pub filter: ForgeFilter,
}

impl ForgeSource {
    pub fn token(&self) -> Option<String> {
        let name = self.token_env.as_deref()?;
        std::env::var(name).ok().filter(|value| !value.is_empty())
    }
}

impl FleetConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&data).context("parse config")?;
        config.layout.validate().context("validate layout")?;
        if let Some(forge) = &config.forge {
            forge.layout.validate().context("validate forge layout")?;
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create config directory")?;
        }
        let data = serde_json::to_string_pretty(self).context("serialize config")?;
        fs::write(path, data).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }

    /// The configured root with `~` expanded, or the current directory.
    pub fn root_dir(&self) -> PathBuf {
        match &self.root {
            Some(root) => expand_home(root),
            None => PathBuf::from("."),
        }
    }

    /// Repos with concrete paths: missing paths are laid out under the root and
    /// relative ones are joined onto it. With a forge source, missing paths stay
    /// empty so the listing's layout decides.
    pub fn resolved_repos(&self) -> anyhow::Result<Vec<RepoSpec>> {
        let root = self.root_dir();
        self.repos
            .iter()
            .map(|repo| {
                let mut repo = repo.clone();
                if repo.path.as_os_str().is_empty() {
                    if self.forge.is_none() {
                        repo.path = repo_path(&root, &[], &repo.name, &self.layout)
                            .with_context(|| format!("place repo {}", repo.name))?;
                    }
                } else {
                    let path = expand_home(&repo.path);
                    repo.path = if path.is_relative() {
                        root.join(path)
                    } else {
                        path
                    };
                }
                Ok(repo)
            })
            .collect()
    }

    pub fn plan_request(&self, cleanup: bool) -> anyhow::Result<PlanRequest> {
        let cleanup_orphans = cleanup || self.cleanup.enabled;
        let cleanup_roots = if self.cleanup.roots.is_empty() {
            vec![self.root_dir()]
        } else {
            self.cleanup.roots.iter().map(|root| expand_home(root)).collect()
        };
        Ok(PlanRequest {
            repos: self.resolved_repos()?,
            options: PlanOptions {
                default_strategy: Some(self.defaults.strategy),
                cleanup_orphans,
                cleanup_roots: if cleanup_orphans { cleanup_roots } else { Vec::new() },
            },
        })
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            parallelism: self.defaults.parallelism,
            max_retries: self.defaults.max_retries,
            retry_backoff: self.defaults.retry_backoff,
            strict_branch: self.defaults.strict_branch,
            ..RunOptions::default()
        }
    }

    pub fn diagnostic_options(&self) -> DiagnosticOptions {
        DiagnosticOptions {
            skip_fetch: self.health.skip_fetch,
            fetch_timeout: self.health.fetch_timeout,
            parallelism: self.health.parallelism,
            ..DiagnosticOptions::default()
        }
    }

    pub fn state_file(&self) -> anyhow::Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(expand_home(path)),
            None => default_state_path(),
        }
    }
}

fn project_dirs() -> anyhow::Result<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION).context("resolve project dirs")
}

pub fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.json"))
}

pub fn default_state_path() -> anyhow::Result<PathBuf> {
    Ok(project_dirs()?.data_local_dir().join("state.json"))
}

pub fn default_audit_dir() -> anyhow::Result<PathBuf> {
    Ok(project_dirs()?.data_local_dir().join("audit"))
}
