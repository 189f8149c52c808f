use crate::cancel::CancelToken;
use crate::git_command::{GitCommand, parse_progress};
use crate::model::Strategy;
use anyhow::Context;
use git2::{BranchType, Repository, Status, StatusOptions};
use std::path::Path;
use tracing::{debug, info};

/// What `clone_or_update` should do with the destination.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GitStrategy {
    Clone,
    Reset,
    Pull,
    Fetch,
}

impl From<Strategy> for GitStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Reset => GitStrategy::Reset,
            Strategy::Pull => GitStrategy::Pull,
            Strategy::Fetch => GitStrategy::Fetch,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CloneRequest<'a> {
    /// URL used for the network operation, possibly carrying credentials.
    pub url: &'a str,
    /// Credential-free URL recorded as `origin`.
    pub plain_url: &'a str,
    pub dest: &'a Path,
    pub strategy: GitStrategy,
    pub env: &'a [(String, String)],
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BranchInfo {
    pub branch: String,
    /// Short upstream name such as `origin/main`.
    pub upstream: Option<String>,
    pub ahead: usize,
    pub behind: usize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct WorkTreeCounts {
    pub modified: usize,
    pub staged: usize,
    pub untracked: usize,
    pub conflicts: usize,
}

impl WorkTreeCounts {
    pub fn changed(&self) -> usize {
        self.modified + self.staged + self.untracked
    }
}

#[derive(Debug, Default)]
pub struct FetchOutput {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<anyhow::Error>,
}

/// Mutating git operations used by the executor.
pub trait GitOps: Send + Sync {
    fn clone_or_update(
        &self,
        ctx: &CancelToken,
        request: &CloneRequest<'_>,
        progress: &mut dyn FnMut(&str, f32),
    ) -> anyhow::Result<String>;

    fn checkout(&self, ctx: &CancelToken, path: &Path, branch: &str) -> anyhow::Result<String>;

    /// True when `branch` exists locally or as a remote-tracking branch.
    fn branch_exists(&self, path: &Path, branch: &str) -> anyhow::Result<bool>;

    fn configure_remote(&self, path: &Path, name: &str, url: &str) -> anyhow::Result<String>;
}

/// Read-mostly git queries used by diagnostics.
pub trait RepoInspector: Send + Sync {
    fn open(&self, path: &Path) -> anyhow::Result<()>;

    fn branch_info(&self, path: &Path) -> anyhow::Result<BranchInfo>;

    fn work_tree_counts(&self, path: &Path) -> anyhow::Result<WorkTreeCounts>;

    fn fetch_all(&self, ctx: &CancelToken, path: &Path) -> FetchOutput;
}

/// Network operations through the `git` binary, local inspection through libgit2.
#[derive(Clone, Copy, Debug, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    fn clone_repo(
        &self,
        ctx: &CancelToken,
        request: &CloneRequest<'_>,
        progress: &mut dyn FnMut(&str, f32),
    ) -> anyhow::Result<String> {
        info!(path = %request.dest.display(), "cloning repo");
        GitCommand::new()
            .args(["clone", "--progress", "--"])
            .arg(request.url)
            .arg(request.dest)
            .envs(request.env)
            .run(ctx, |line| report_progress(line, progress))?;

        if request.url != request.plain_url {
            let repo = Repository::open(request.dest).context("open cloned repo")?;
            ensure_remote(&repo, "origin", request.plain_url)?;
        }
        Ok("cloned".to_string())
    }

    fn update_repo(
        &self,
        ctx: &CancelToken,
        request: &CloneRequest<'_>,
        progress: &mut dyn FnMut(&str, f32),
    ) -> anyhow::Result<String> {
        {
            let repo = Repository::open(request.dest).context("open repo")?;
            if !request.plain_url.is_empty() {
                ensure_remote(&repo, "origin", request.plain_url)?;
            }
        }

        let fetch = GitCommand::in_dir(request.dest).envs(request.env);
        let fetch = if request.url != request.plain_url {
            fetch
                .args(["fetch", "--prune", "--progress"])
                .arg(request.url)
                .arg("+refs/heads/*:refs/remotes/origin/*")
        } else {
            fetch.args(["fetch", "--all", "--prune", "--progress"])
        };
        debug!(path = %request.dest.display(), command = %fetch.describe(), "fetching");
        fetch.run(ctx, |line| report_progress(line, progress))?;

        match request.strategy {
            GitStrategy::Reset => {
                GitCommand::in_dir(request.dest)
                    .args(["reset", "--hard", "@{upstream}"])
                    .run(ctx, |_| {})?;
                Ok("updated (reset)".to_string())
            }
            GitStrategy::Pull => {
                GitCommand::in_dir(request.dest)
                    .args(["merge", "--ff-only", "@{upstream}"])
                    .run(ctx, |_| {})?;
                Ok("updated (pull)".to_string())
            }
            GitStrategy::Fetch | GitStrategy::Clone => Ok("fetched".to_string()),
        }
    }
}

fn report_progress(line: &str, progress: &mut dyn FnMut(&str, f32)) {
    if let Some((stage, fraction)) = parse_progress(line) {
        progress(&stage, fraction);
    }
}

impl GitOps for GitCli {
    fn clone_or_update(
        &self,
        ctx: &CancelToken,
        request: &CloneRequest<'_>,
        progress: &mut dyn FnMut(&str, f32),
    ) -> anyhow::Result<String> {
        match request.strategy {
            GitStrategy::Clone => self.clone_repo(ctx, request, progress),
            _ => self.update_repo(ctx, request, progress),
        }
    }

    fn checkout(&self, ctx: &CancelToken, path: &Path, branch: &str) -> anyhow::Result<String> {
        let output = GitCommand::in_dir(path)
            .args(["checkout", branch])
            .run(ctx, |_| {})?;
        let message = output.stderr.trim();
        if message.is_empty() {
            Ok(format!("checked out {branch}"))
        } else {
            Ok(message.to_string())
        }
    }

    fn branch_exists(&self, path: &Path, branch: &str) -> anyhow::Result<bool> {
        let repo = Repository::open(path).context("open repo")?;
        if repo.find_branch(branch, BranchType::Local).is_ok() {
            return Ok(true);
        }
        let suffix = format!("/{branch}");
        for entry in repo
            .branches(Some(BranchType::Remote))
            .context("list remote branches")?
        {
            let (remote_branch, _) = entry.context("read remote branch")?;
            if let Some(name) = remote_branch.name().context("read branch name")?
                && name.ends_with(&suffix)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn configure_remote(&self, path: &Path, name: &str, url: &str) -> anyhow::Result<String> {
        let repo = Repository::open(path).context("open repo")?;
        let change = ensure_remote(&repo, name, url)?;
        Ok(format!("remote {name} {change}"))
    }
}

impl RepoInspector for GitCli {
    fn open(&self, path: &Path) -> anyhow::Result<()> {
        Repository::open(path).context("open repo")?;
        Ok(())
    }

    fn branch_info(&self, path: &Path) -> anyhow::Result<BranchInfo> {
        let repo = Repository::open(path).context("open repo")?;
        let head = repo.head().context("read HEAD")?;
        if !head.is_branch() {
            return Ok(BranchInfo {
                branch: "HEAD".to_string(),
                ..BranchInfo::default()
            });
        }
        let branch_name = head.shorthand().unwrap_or("HEAD").to_string();
        let mut info = BranchInfo {
            branch: branch_name.clone(),
            ..BranchInfo::default()
        };

        let branch = repo
            .find_branch(&branch_name, BranchType::Local)
            .context("find current branch")?;
        if let Ok(upstream) = branch.upstream() {
            info.upstream = upstream.name().ok().flatten().map(str::to_string);
            if let (Some(local_oid), Some(upstream_oid)) = (head.target(), upstream.get().target())
            {
                let (ahead, behind) = repo
                    .graph_ahead_behind(local_oid, upstream_oid)
                    .context("compare with upstream")?;
                info.ahead = ahead;
                info.behind = behind;
            }
        }
        Ok(info)
    }

    fn work_tree_counts(&self, path: &Path) -> anyhow::Result<WorkTreeCounts> {
        let repo = Repository::open(path).context("open repo")?;
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut options)).context("status repo")?;

        let mut counts = WorkTreeCounts::default();
        for entry in statuses.iter() {
            let status = entry.status();
            if status.is_conflicted() {
                counts.conflicts += 1;
                continue;
            }
            if status.intersects(
                Status::INDEX_NEW
                    | Status::INDEX_MODIFIED
                    | Status::INDEX_DELETED
                    | Status::INDEX_RENAMED
                    | Status::INDEX_TYPECHANGE,
            ) {
                counts.staged += 1;
            }
            if status.intersects(
                Status::WT_MODIFIED | Status::WT_DELETED | Status::WT_RENAMED | Status::WT_TYPECHANGE,
            ) {
                counts.modified += 1;
            }
            if status.contains(Status::WT_NEW) {
                counts.untracked += 1;
            }
        }
        Ok(counts)
    }

    fn fetch_all(&self, ctx: &CancelToken, path: &Path) -> FetchOutput {
        let command = GitCommand::in_dir(path).args(["fetch", "--all", "--prune"]);
        match command.output(ctx, |_| {}) {
            Ok(output) if output.success => FetchOutput {
                stdout: output.stdout,
                stderr: output.stderr,
                error: None,
            },
            Ok(output) => {
                let error = anyhow::anyhow!(
                    "{} failed: {}",
                    command.describe(),
                    output.stderr.trim()
                );
                FetchOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    error: Some(error),
                }
            }
            Err(err) => FetchOutput {
                error: Some(err),
                ..FetchOutput::default()
            },
        }
    }
}

/// Creates or repoints a named remote. Returns what changed.
fn ensure_remote(repo: &Repository, name: &str, url: &str) -> anyhow::Result<&'static str> {
    match repo.find_remote(name) {
        Ok(remote) => {
            if remote.url() == Some(url) {
                return Ok("unchanged");
            }
            repo.remote_set_url(name, url)
                .with_context(|| format!("update {name} remote url"))?;
            Ok("updated")
        }
        Err(_) => {
            repo.remote(name, url)
                .with_context(|| format!("create {name} remote"))?;
            Ok("added")
        }
    }
}
