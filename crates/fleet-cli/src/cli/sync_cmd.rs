use super::args::SyncArgs;
use super::shared::{ConsoleProgress, build_planner, summary_line};
use super::state_path;
use fleet_core::CancelToken;
use fleet_core::RunError;
use fleet_core::audit::{AuditLogger, AuditStatus};
use fleet_core::config::FleetConfig;
use fleet_core::executor::{Executor, GitExecutor, NoopExecutor};
use fleet_core::runner::Runner;
use fleet_core::state::FileStateStore;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

pub(super) fn handle_sync(
    ctx: &CancelToken,
    config: &FleetConfig,
    args: SyncArgs,
    audit: &AuditLogger,
) -> anyhow::Result<()> {
    let mut options = config.run_options();
    options.dry_run = args.dry_run;
    options.resume = args.resume;
    if let Some(jobs) = args.jobs {
        options.parallelism = jobs;
    }

    let executor: Arc<dyn Executor> = if args.dry_run {
        Arc::new(NoopExecutor)
    } else {
        Arc::new(GitExecutor::default())
    };
    let state = state_path(config, args.state)?;
    let runner = Runner::new()
        .planner(build_planner(config)?)
        .executor(executor)
        .state(Arc::new(FileStateStore::new(state)))
        .default_strategy(config.defaults.strategy);
    let request = config.plan_request(args.cleanup)?;

    let progress = ConsoleProgress::new(Some(audit));
    let result = match runner.run(ctx, &request, &options, &progress) {
        Ok(result) => result,
        Err(RunError::Persist { result, cause }) => {
            warn!(error = %format!("{cause:#}"), "run state not saved; resume will redo this run");
            *result
        }
        Err(RunError::Failed(err)) => return Err(err),
    };

    println!("{}", summary_line(&result));
    let details = json!({
        "succeeded": result.succeeded.len(),
        "failed": result.failed.len(),
        "skipped": result.skipped.len(),
        "dry_run": args.dry_run,
    });
    if result.has_failures() {
        let message = format!("{} action(s) failed", result.failed.len());
        audit.record("sync.finished", AuditStatus::Failed, Some("sync"), Some(details), Some(&message))?;
        anyhow::bail!(message);
    }
    audit.record("sync.finished", AuditStatus::Ok, Some("sync"), Some(details), None)?;
    Ok(())
}
