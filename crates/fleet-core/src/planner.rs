use crate::cancel::CancelToken;
use crate::model::{Action, ActionType, Plan, RepoSpec, Strategy};
use crate::paths::{is_dot_entry, is_strict_ancestor, resolve_path};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Options shared by every planner.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct PlanOptions {
    /// Strategy for repos without their own override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_strategy: Option<Strategy>,
    #[serde(default)]
    pub cleanup_orphans: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cleanup_roots: Vec<PathBuf>,
}

impl PlanOptions {
    pub fn strategy_for(&self, repo: &RepoSpec) -> Strategy {
        repo.strategy
            .or(self.default_strategy)
            .unwrap_or_default()
    }
}

/// Desired repos plus options, as handed to the runner.
#[derive(Clone, Debug, Default)]
pub struct PlanRequest {
    pub repos: Vec<RepoSpec>,
    pub options: PlanOptions,
}

/// Turns a desired state into actions. Implementations never mutate `desired`.
pub trait Planner: Send + Sync {
    fn name(&self) -> &'static str;

    fn plan(
        &self,
        ctx: &CancelToken,
        desired: &[RepoSpec],
        options: &PlanOptions,
    ) -> anyhow::Result<Plan>;
}

/// A directory counts as a repository when it carries a `.git` entry
/// (directory for normal checkouts, file for worktrees and submodules).
pub fn is_git_repo(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Drops later repos that reuse an earlier target path, so each path gets one action.
pub(crate) fn unique_targets(desired: &[RepoSpec]) -> Vec<&RepoSpec> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(desired.len());
    for repo in desired {
        if seen.insert(repo.path.as_path()) {
            unique.push(repo);
        } else {
            warn!(
                repo = %repo.name,
                path = %repo.path.display(),
                "duplicate target path; keeping first repo"
            );
        }
    }
    unique
}

pub(crate) struct OrphanScan<'a> {
    pub roots: &'a [PathBuf],
    pub targets: &'a [&'a Path],
    /// Only directories that are themselves repositories count as orphans.
    pub require_marker: bool,
    pub strategy: Strategy,
    pub planner: &'static str,
}

/// Delete actions for immediate children of the cleanup roots that no desired
/// repo owns. Dot-directories and ancestors of desired targets are never orphans.
///
/// Roots, children and targets are compared in resolved form, so a root spelled
/// with `..`, a symlink or a relative path still protects the repos beneath it.
pub(crate) fn scan_orphans(ctx: &CancelToken, scan: &OrphanScan<'_>) -> anyhow::Result<Vec<Action>> {
    let targets: Vec<PathBuf> = scan.targets.iter().map(|target| resolve_path(target)).collect();
    let mut seen = HashSet::new();
    let mut actions = Vec::new();
    for root in scan.roots {
        ctx.check()?;
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(root = %root.display(), "cleanup root missing; nothing to scan");
                continue;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read cleanup root {}", root.display()));
            }
        };

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.context("read cleanup root entry")?;
            let path = entry.path();
            if path.is_dir() {
                children.push(path);
            }
        }
        children.sort();

        for child in children {
            let resolved = resolve_path(&child);
            if is_dot_entry(&child)
                || targets.iter().any(|target| *target == resolved)
                || targets
                    .iter()
                    .any(|target| is_strict_ancestor(&resolved, target))
                || (scan.require_marker && !is_git_repo(&child))
                || !seen.insert(resolved)
            {
                continue;
            }
            let name = child
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            info!(path = %child.display(), planner = scan.planner, "orphan marked for delete");
            actions.push(Action::new(
                RepoSpec {
                    name,
                    path: child,
                    ..RepoSpec::default()
                },
                ActionType::Delete,
                scan.strategy,
                format!("orphan under {}", root.display()),
                scan.planner,
            ));
        }
    }
    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn repo_override_beats_default_strategy() {
        let options = PlanOptions {
            default_strategy: Some(Strategy::Fetch),
            ..PlanOptions::default()
        };
        let mut repo = RepoSpec::new("a", "u", "/p");
        assert_eq!(options.strategy_for(&repo), Strategy::Fetch);
        repo.strategy = Some(Strategy::Pull);
        assert_eq!(options.strategy_for(&repo), Strategy::Pull);
        assert_eq!(
            PlanOptions::default().strategy_for(&RepoSpec::default()),
            Strategy::Reset
        );
    }

    #[test]
    fn duplicate_targets_keep_first() {
        let desired = vec![
            RepoSpec::new("a", "u1", "/r/x"),
            RepoSpec::new("b", "u2", "/r/x"),
            RepoSpec::new("c", "u3", "/r/y"),
        ];
        let names: Vec<_> = unique_targets(&desired)
            .into_iter()
            .map(|repo| repo.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn git_marker_may_be_file_or_dir() {
        let tmp = TempDir::new().unwrap();
        assert!(!is_git_repo(tmp.path()));
        std::fs::write(tmp.path().join(".git"), "gitdir: ../x").unwrap();
        assert!(is_git_repo(tmp.path()));
    }

    fn deletes(ctx: &CancelToken, roots: &[PathBuf], targets: &[&Path]) -> Vec<PathBuf> {
        scan_orphans(
            ctx,
            &OrphanScan {
                roots,
                targets,
                require_marker: false,
                strategy: Strategy::Reset,
                planner: "test",
            },
        )
        .unwrap()
        .into_iter()
        .map(|action| action.repo.path)
        .collect()
    }

    #[test]
    fn root_spelled_differently_still_protects_targets() {
        let tmp = TempDir::new().unwrap();
        let fleet = tmp.path().join("fleet");
        let wanted = fleet.join("wanted");
        fs::create_dir_all(wanted.join(".git")).unwrap();
        fs::create_dir_all(fleet.join("team").join("svc")).unwrap();
        fs::create_dir_all(fleet.join("stale")).unwrap();
        let nested = fleet.join("team").join("svc");

        let roots = vec![fleet.join("..").join("fleet"), fleet.join(".")];
        let found = deletes(&CancelToken::new(), &roots, &[wanted.as_path(), nested.as_path()]);
        assert_eq!(found.len(), 1, "{found:?}");
        assert!(found[0].ends_with("stale"));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_root_still_protects_targets() {
        let tmp = TempDir::new().unwrap();
        let fleet = tmp.path().join("fleet");
        fs::create_dir_all(fleet.join("wanted")).unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&fleet, &link).unwrap();

        let wanted = fleet.join("wanted");
        let found = deletes(&CancelToken::new(), &[link], &[wanted.as_path()]);
        assert!(found.is_empty(), "{found:?}");
    }
}
