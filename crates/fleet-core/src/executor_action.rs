use crate::auth::{mask_token_in_url, prepare_auth};
use crate::cancel::CancelToken;
use crate::error::FleetError;
use crate::executor::RunOptions;
use crate::git::{CloneRequest, GitOps, GitStrategy};
use crate::model::{Action, ActionResult, ActionType};
use crate::planner::is_git_repo;
use anyhow::{Context, bail};
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info, warn};

pub(crate) const SKIP_MESSAGE: &str = "skipped by plan";

pub(crate) fn run_action(
    git: &dyn GitOps,
    ctx: &CancelToken,
    action: &Action,
    options: &RunOptions,
    progress: &mut dyn FnMut(&str, f32),
) -> ActionResult {
    if options.dry_run {
        return ActionResult::skipped(
            action.clone(),
            format!("dry run: would {} ({})", action.label(), action.reason),
        );
    }
    let outcome = match action.kind {
        ActionType::Clone | ActionType::Update => sync_repo(git, ctx, action, options, progress),
        ActionType::Delete => delete_repo(action),
        ActionType::Skip => return ActionResult::skipped(action.clone(), SKIP_MESSAGE),
    };
    match outcome {
        Ok(message) => {
            info!(repo = %action.repo.name, action = %action.kind, "{message}");
            ActionResult::succeeded(action.clone(), message)
        }
        Err(err) => {
            warn!(repo = %action.repo.name, action = %action.kind, error = %format!("{err:#}"), "action failed");
            ActionResult::failed(action.clone(), format!("{} failed", action.kind), &err)
        }
    }
}

/// Result for an action that never ran because the run was cancelled.
pub(crate) fn cancelled_result(action: &Action, cause: FleetError) -> ActionResult {
    ActionResult::failed(action.clone(), "not started", &anyhow::Error::from(cause))
}

fn sync_repo(
    git: &dyn GitOps,
    ctx: &CancelToken,
    action: &Action,
    options: &RunOptions,
    progress: &mut dyn FnMut(&str, f32),
) -> anyhow::Result<String> {
    let repo = &action.repo;
    if repo.url.trim().is_empty() {
        return Err(FleetError::MissingCloneUrl(repo.name.clone()).into());
    }
    if repo.path.as_os_str().is_empty() {
        return Err(FleetError::MissingTargetPath(repo.name.clone()).into());
    }
    if let Some(parent) = repo.path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent directory {}", parent.display()))?;
    }

    if action.kind == ActionType::Clone && is_git_repo(&repo.path) {
        return Err(FleetError::TargetIsRepository(repo.path.clone()).into());
    }

    let auth = prepare_auth(&repo.url, repo.auth.as_ref())?;
    if let Some(warning) = &auth.warning {
        warn!(repo = %repo.name, "{warning}");
    }
    let strategy = match action.kind {
        ActionType::Clone => GitStrategy::Clone,
        _ => GitStrategy::from(action.strategy),
    };
    let request = CloneRequest {
        url: &auth.url,
        plain_url: &repo.url,
        dest: &repo.path,
        strategy,
        env: &auth.env,
    };

    let attempts = options.max_retries.saturating_add(1);
    let mut attempt = 0;
    let mut message = loop {
        attempt += 1;
        ctx.check()?;
        if strategy == GitStrategy::Clone {
            clear_target(&repo.path)?;
        }
        debug!(
            repo = %repo.name,
            url = %mask_token_in_url(&auth.url),
            attempt,
            attempts,
            "running git"
        );
        match git.clone_or_update(ctx, &request, progress) {
            Ok(message) => break message,
            Err(err) if FleetError::is_cancellation(&err) => return Err(err),
            Err(err) if attempt >= attempts => {
                return Err(err.context(format!("gave up after {attempt} attempts")));
            }
            Err(err) => {
                let backoff = options.retry_backoff * attempt;
                warn!(
                    repo = %repo.name,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %format!("{err:#}"),
                    "git failed; retrying"
                );
                ctx.sleep(backoff)?;
            }
        }
    };
    // Removes a materialized ssh key.
    drop(auth);

    let candidates = repo.branch_candidates();
    if !candidates.is_empty() {
        match checkout_first(git, ctx, &repo.path, &candidates) {
            Ok(note) => message = format!("{message}; {note}"),
            Err(err) if options.strict_branch => return Err(err),
            Err(err) => {
                warn!(repo = %repo.name, error = %format!("{err:#}"), "branch checkout skipped");
                message = format!("{message}; warning: {err:#}");
            }
        }
    }

    for (name, url) in &repo.remotes {
        if let Err(err) = git.configure_remote(&repo.path, name, url) {
            warn!(repo = %repo.name, remote = %name, error = %format!("{err:#}"), "remote not configured");
            message = format!("{message}; warning: remote {name}: {err:#}");
        }
    }

    Ok(message)
}

/// Checks out the first candidate that exists locally or on a remote.
fn checkout_first(
    git: &dyn GitOps,
    ctx: &CancelToken,
    path: &Path,
    candidates: &[&str],
) -> anyhow::Result<String> {
    for branch in candidates {
        if git.branch_exists(path, branch)? {
            git.checkout(ctx, path, branch)
                .with_context(|| format!("checkout {branch}"))?;
            return Ok(format!("on branch {branch}"));
        }
    }
    bail!("none of the branches exist: {}", candidates.join(", "))
}

/// Removes whatever sits at a clone destination so git can create it fresh.
fn clear_target(path: &Path) -> anyhow::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("clear clone target {}", path.display()))
}

fn delete_repo(action: &Action) -> anyhow::Result<String> {
    let path = &action.repo.path;
    if path.as_os_str().is_empty() {
        return Err(FleetError::MissingTargetPath(action.repo.name.clone()).into());
    }
    if fs::symlink_metadata(path).is_err() {
        return Ok("already absent".to_string());
    }
    clear_target(path)?;
    Ok(format!("deleted {}", path.display()))
}
