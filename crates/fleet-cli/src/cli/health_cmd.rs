use super::args::HealthArgs;
use super::shared::build_planner;
use fleet_core::CancelToken;
use fleet_core::config::FleetConfig;
use fleet_core::diagnostic::{HealthReport, HealthStatus, RepoHealth};
use fleet_core::diagnostic_executor::DiagnosticExecutor;
use fleet_core::model::{ActionType, RepoSpec};
use fleet_core::runner::Runner;

pub(super) fn handle_health(
    ctx: &CancelToken,
    config: &FleetConfig,
    args: HealthArgs,
) -> anyhow::Result<()> {
    let repos = repos_to_check(ctx, config)?;
    let mut options = config.diagnostic_options();
    options.skip_fetch |= args.skip_fetch;
    if let Some(jobs) = args.jobs {
        options.parallelism = jobs;
    }
    if !args.json {
        options = options.on_progress(|health, done, total| {
            eprintln!("[{done}/{total}] {} {}", health.repo.name, health.status);
        });
    }

    let report = DiagnosticExecutor::default().check_health(ctx, &repos, &options)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    if report.summary.error > 0 || report.summary.unreachable > 0 {
        anyhow::bail!(
            "{} repo(s) need attention",
            report.summary.error + report.summary.unreachable
        );
    }
    Ok(())
}

/// Every enabled repo the plan knows about, orphans excluded.
fn repos_to_check(ctx: &CancelToken, config: &FleetConfig) -> anyhow::Result<Vec<RepoSpec>> {
    let runner = Runner::new()
        .planner(build_planner(config)?)
        .default_strategy(config.defaults.strategy);
    let plan = runner.plan(ctx, &config.plan_request(false)?)?;
    Ok(plan
        .actions
        .into_iter()
        .filter(|action| matches!(action.kind, ActionType::Clone | ActionType::Update))
        .map(|action| action.repo)
        .collect())
}

fn print_report(report: &HealthReport) {
    for health in &report.results {
        println!("{}", health_line(health));
        if !health.recommendation.is_empty() && health.status != HealthStatus::Healthy {
            println!("    -> {}", health.recommendation);
        }
    }
    let summary = &report.summary;
    println!(
        "Total: {}  Healthy: {}  Warning: {}  Error: {}  Unreachable: {}  ({} ms)",
        summary.total,
        summary.healthy,
        summary.warning,
        summary.error,
        summary.unreachable,
        report.duration.as_millis()
    );
}

pub(super) fn health_line(health: &RepoHealth) -> String {
    let mut line = format!(
        "{:<11} {:<30} {:<16} {}",
        health.status.as_str(),
        health.repo.name,
        health.branch,
        health.divergence.as_str()
    );
    if health.ahead > 0 || health.behind > 0 {
        line.push_str(&format!(" +{}/-{}", health.ahead, health.behind));
    }
    let changed = health.changed_files();
    if changed > 0 {
        line.push_str(&format!(" {changed} changed"));
    }
    if let Some(error) = &health.error {
        line.push_str(&format!(" ({error})"));
    }
    line
}
