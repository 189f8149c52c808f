pub mod github;
pub mod gitlab;
mod http;
mod paging;

use fleet_core::planner_forge::ForgeProvider;
use github::{GITHUB_KIND, GitHubProvider};
use gitlab::{GITLAB_KIND, GitLabProvider};
use std::sync::Arc;

pub(crate) const USER_AGENT: &str = concat!("repo-fleet/", env!("CARGO_PKG_VERSION"));

/// Builds the provider registered under `kind` (`github` or `gitlab`).
pub fn provider_for(
    kind: &str,
    base_url: Option<&str>,
    token: Option<String>,
) -> anyhow::Result<Arc<dyn ForgeProvider>> {
    match kind.to_ascii_lowercase().as_str() {
        GITHUB_KIND => Ok(Arc::new(GitHubProvider::new(base_url, token)?)),
        GITLAB_KIND => Ok(Arc::new(GitLabProvider::new(base_url, token)?)),
        other => anyhow::bail!("unknown forge provider {other:?} (expected github or gitlab)"),
    }
}
