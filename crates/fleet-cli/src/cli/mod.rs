use anyhow::Context;
use clap::Parser;
use fleet_core::CancelToken;
use fleet_core::audit::{AuditLogger, AuditStatus, DEFAULT_MAX_BYTES};
use fleet_core::config::{FleetConfig, default_audit_dir, default_config_path};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod args;
mod health_cmd;
mod plan_cmd;
mod shared;
mod sync_cmd;

use args::{Cli, Commands};
use health_cmd::handle_health;
use plan_cmd::handle_plan;
use sync_cmd::handle_sync;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let config = FleetConfig::load(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    let audit_dir = match &cli.audit_dir {
        Some(dir) => dir.clone(),
        None => default_audit_dir()?,
    };
    let audit = AuditLogger::new(audit_dir, DEFAULT_MAX_BYTES)?;
    let command = cli.command.label();
    info!(command, config = %config_path.display(), "running command");
    audit.record("app.start", AuditStatus::Ok, Some(command), None, None)?;

    let ctx = CancelToken::new();
    let result = match cli.command {
        Commands::Plan(args) => handle_plan(&ctx, &config, args),
        Commands::Sync(args) => handle_sync(&ctx, &config, args, &audit),
        Commands::Health(args) => handle_health(&ctx, &config, args),
    };
    match &result {
        Ok(()) => audit.record("app.finish", AuditStatus::Ok, Some(command), None, None)?,
        Err(err) => audit.record(
            "app.finish",
            AuditStatus::Failed,
            Some(command),
            None,
            Some(&format!("{err:#}")),
        )?,
    };
    result
}

fn state_path(config: &FleetConfig, override_path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path),
        None => config.state_file(),
    }
}
