use crate::cancel::CancelToken;
use crate::error::FleetError;
use crate::model::{Action, ActionType, Plan, RepoSpec};
use crate::planner::{OrphanScan, PlanOptions, Planner, is_git_repo, scan_orphans, unique_targets};
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

pub const FILESYSTEM_PLANNER: &str = "filesystem";

/// Plans by looking at what is on disk at each target path.
#[derive(Clone, Copy, Debug, Default)]
pub struct FilesystemPlanner;

impl FilesystemPlanner {
    pub fn new() -> Self {
        Self
    }
}

/// Clone-or-update decision for one target path, with the reason shown to users.
pub(crate) fn classify_target(path: &Path) -> anyhow::Result<(ActionType, &'static str)> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok((ActionType::Clone, "target missing"));
        }
        Err(err) => {
            return Err(anyhow::Error::new(err).context(format!("stat {}", path.display())));
        }
    };
    if !metadata.is_dir() {
        return Ok((ActionType::Clone, "target is not a directory; replacing"));
    }
    if is_git_repo(path) {
        Ok((ActionType::Update, "repository present"))
    } else {
        Ok((ActionType::Clone, "directory is not a repository; replacing"))
    }
}

impl Planner for FilesystemPlanner {
    fn name(&self) -> &'static str {
        FILESYSTEM_PLANNER
    }

    fn plan(
        &self,
        ctx: &CancelToken,
        desired: &[RepoSpec],
        options: &PlanOptions,
    ) -> anyhow::Result<Plan> {
        if desired.is_empty() {
            return Err(FleetError::NoRepositories.into());
        }

        let repos = unique_targets(desired);
        let mut actions = Vec::with_capacity(repos.len());
        for repo in &repos {
            ctx.check()?;
            let strategy = options.strategy_for(repo);
            if !repo.enabled() {
                actions.push(Action::new(
                    (*repo).clone(),
                    ActionType::Skip,
                    strategy,
                    "disabled",
                    FILESYSTEM_PLANNER,
                ));
                continue;
            }
            let (kind, reason) = classify_target(&repo.path)?;
            debug!(repo = %repo.name, path = %repo.path.display(), action = %kind, reason, "planned");
            actions.push(Action::new(
                (*repo).clone(),
                kind,
                strategy,
                reason,
                FILESYSTEM_PLANNER,
            ));
        }

        if options.cleanup_orphans {
            let targets: Vec<&Path> = repos.iter().map(|repo| repo.path.as_path()).collect();
            actions.extend(scan_orphans(
                ctx,
                &OrphanScan {
                    roots: &options.cleanup_roots,
                    targets: &targets,
                    require_marker: false,
                    strategy: options.default_strategy.unwrap_or_default(),
                    planner: FILESYSTEM_PLANNER,
                },
            )?);
        }

        Ok(Plan::new(actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Strategy;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn make_repo(path: &Path) {
        fs::create_dir_all(path.join(".git")).unwrap();
    }

    fn spec(name: &str, path: PathBuf) -> RepoSpec {
        RepoSpec::new(name, format!("https://example.com/{name}.git"), path)
    }

    fn kind_for(plan: &Plan, name: &str) -> ActionType {
        plan.actions
            .iter()
            .find(|action| action.repo.name == name)
            .map(|action| action.kind)
            .unwrap()
    }

    #[test]
    fn empty_desired_set_is_an_error() {
        let err = FilesystemPlanner
            .plan(&CancelToken::new(), &[], &PlanOptions::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FleetError>(),
            Some(FleetError::NoRepositories)
        ));
    }

    #[test]
    fn classifies_each_target_shape() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("missing");
        let file = tmp.path().join("file");
        fs::write(&file, "x").unwrap();
        let plain = tmp.path().join("plain");
        fs::create_dir_all(&plain).unwrap();
        let repo = tmp.path().join("repo");
        make_repo(&repo);

        let desired = vec![
            spec("missing", missing),
            spec("file", file),
            spec("plain", plain),
            spec("repo", repo),
        ];
        let plan = FilesystemPlanner
            .plan(&CancelToken::new(), &desired, &PlanOptions::default())
            .unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(kind_for(&plan, "missing"), ActionType::Clone);
        assert_eq!(kind_for(&plan, "file"), ActionType::Clone);
        assert_eq!(kind_for(&plan, "plain"), ActionType::Clone);
        assert_eq!(kind_for(&plan, "repo"), ActionType::Update);
        assert!(plan.actions.iter().all(|action| action.planner == "filesystem"));
    }

    #[test]
    fn disabled_repos_become_skips_and_strategy_defaults_apply() {
        let tmp = TempDir::new().unwrap();
        let mut off = spec("off", tmp.path().join("off"));
        off.enabled = Some(false);
        let mut pinned = spec("pinned", tmp.path().join("pinned"));
        pinned.strategy = Some(Strategy::Pull);
        let options = PlanOptions {
            default_strategy: Some(Strategy::Fetch),
            ..PlanOptions::default()
        };
        let plan = FilesystemPlanner
            .plan(&CancelToken::new(), &[off, pinned], &options)
            .unwrap();
        assert_eq!(plan.actions[0].kind, ActionType::Skip);
        assert_eq!(plan.actions[0].strategy, Strategy::Fetch);
        assert_eq!(plan.actions[1].strategy, Strategy::Pull);
    }

    #[test]
    fn orphans_exclude_targets_dot_dirs_and_ancestors() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let wanted = root.join("wanted");
        make_repo(&wanted);
        let nested_target = root.join("team").join("deep").join("svc");
        fs::create_dir_all(root.join("team").join("deep")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::create_dir_all(root.join("stale")).unwrap();
        fs::write(root.join("notes.txt"), "x").unwrap();

        let desired = vec![spec("wanted", wanted), spec("svc", nested_target)];
        let options = PlanOptions {
            cleanup_orphans: true,
            cleanup_roots: vec![root.clone(), root.clone()],
            ..PlanOptions::default()
        };
        let plan = FilesystemPlanner
            .plan(&CancelToken::new(), &desired, &options)
            .unwrap();
        let deletes: Vec<_> = plan
            .actions
            .iter()
            .filter(|action| action.kind == ActionType::Delete)
            .map(|action| action.repo.path.clone())
            .collect();
        assert_eq!(deletes, vec![root.join("stale")]);
    }

    #[test]
    fn cleanup_without_flag_never_deletes() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("stale")).unwrap();
        let options = PlanOptions {
            cleanup_roots: vec![tmp.path().to_path_buf()],
            ..PlanOptions::default()
        };
        let plan = FilesystemPlanner
            .plan(
                &CancelToken::new(),
                &[spec("a", tmp.path().join("a"))],
                &options,
            )
            .unwrap();
        assert_eq!(plan.count(ActionType::Delete), 0);
    }

    #[test]
    fn cancellation_is_returned_immediately() {
        let ctx = CancelToken::new();
        ctx.cancel();
        let err = FilesystemPlanner
            .plan(&ctx, &[spec("a", "/nowhere/a".into())], &PlanOptions::default())
            .unwrap_err();
        assert!(FleetError::is_cancellation(&err));
    }

    #[test]
    fn desired_input_is_not_mutated() {
        let tmp = TempDir::new().unwrap();
        let desired = vec![spec("a", tmp.path().join("a"))];
        let before = desired.clone();
        FilesystemPlanner
            .plan(&CancelToken::new(), &desired, &PlanOptions::default())
            .unwrap();
        assert_eq!(desired, before);
    }
}
