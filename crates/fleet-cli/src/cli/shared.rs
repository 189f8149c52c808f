use fleet_core::audit::AuditLogger;
use fleet_core::config::FleetConfig;
use fleet_core::executor::ProgressSink;
use fleet_core::model::{Action, ActionResult, AuthConfig, ExecutionResult, Plan, ResultKind};
use fleet_core::planner::Planner;
use fleet_core::planner_forge::ForgePlanner;
use fleet_core::planner_fs::FilesystemPlanner;
use std::sync::Arc;
use tracing::{debug, warn};

/// Forge listing when the config names one, otherwise what is on disk.
pub(super) fn build_planner(config: &FleetConfig) -> anyhow::Result<Arc<dyn Planner>> {
    let Some(forge) = &config.forge else {
        return Ok(Arc::new(FilesystemPlanner::new()));
    };
    let token = forge.token();
    let provider =
        fleet_providers::provider_for(&forge.provider, forge.base_url.as_deref(), token.clone())?;
    let mut planner = ForgePlanner::new(provider, forge.target.clone(), config.root_dir())
        .layout(forge.layout.clone())
        .filter(forge.filter.clone())
        .use_ssh(forge.use_ssh);
    if let Some(token) = token
        && !forge.use_ssh
    {
        planner = planner.auth(AuthConfig {
            token: Some(token),
            provider: Some(forge.provider.clone()),
            ..AuthConfig::default()
        });
    }
    Ok(Arc::new(planner))
}

pub(super) fn print_plan(plan: &Plan) {
    if plan.is_empty() {
        println!("Nothing to do.");
        return;
    }
    for action in &plan.actions {
        println!(
            "{:<7} {:<30} {} ({})",
            action.kind.as_str(),
            action.repo.name,
            action.repo.path.display(),
            action.reason
        );
    }
}

pub(super) fn summary_line(result: &ExecutionResult) -> String {
    format!(
        "Succeeded: {}  Failed: {}  Skipped: {}",
        result.succeeded.len(),
        result.failed.len(),
        result.skipped.len()
    )
}

pub(super) fn result_line(result: &ActionResult) -> String {
    let tag = match result.kind {
        ResultKind::Succeeded => "ok",
        ResultKind::Failed => "FAILED",
        ResultKind::Skipped => "skip",
    };
    match &result.error {
        Some(error) => format!("[{tag}] {}: {} ({error})", result.action.label(), result.message),
        None => format!("[{tag}] {}: {}", result.action.label(), result.message),
    }
}

/// Prints one line per started and finished action and audits each outcome.
pub(super) struct ConsoleProgress<'a> {
    audit: Option<&'a AuditLogger>,
}

impl<'a> ConsoleProgress<'a> {
    pub(super) fn new(audit: Option<&'a AuditLogger>) -> Self {
        Self { audit }
    }
}

impl ProgressSink for ConsoleProgress<'_> {
    fn on_start(&self, action: &Action) {
        println!("[....] {}", action.label());
    }

    fn on_progress(&self, action: &Action, message: &str, fraction: f32) {
        debug!(repo = %action.repo.name, message, percent = (fraction * 100.0).round(), "progress");
    }

    fn on_complete(&self, result: &ActionResult) {
        println!("{}", result_line(result));
        if let Some(audit) = self.audit
            && let Err(err) = audit.record_action(result)
        {
            warn!(error = %format!("{err:#}"), "audit write failed");
        }
    }
}
