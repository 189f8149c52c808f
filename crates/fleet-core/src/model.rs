use crate::error::FleetError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// How an existing checkout is brought up to date.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Reset,
    Pull,
    Fetch,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Reset => "reset",
            Strategy::Pull => "pull",
            Strategy::Fetch => "fetch",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = FleetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reset" => Ok(Strategy::Reset),
            "pull" => Ok(Strategy::Pull),
            "fetch" => Ok(Strategy::Fetch),
            _ => Err(FleetError::UnknownStrategy(value.to_string())),
        }
    }
}

/// Credential material attached to a repo.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
}

/// One desired repository.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RepoSpec {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remotes: BTreeMap<String, String>,
    #[serde(default)]
    pub path: PathBuf,
    /// Comma-separated fallback list, first existing branch wins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    /// Caller's claim that a checkout already exists; read only by the static planner.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub present: bool,
}

impl RepoSpec {
    pub fn new(name: impl Into<String>, url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    /// Candidate branches from the comma-separated `branch` field, in order.
    pub fn branch_candidates(&self) -> Vec<&str> {
        self.branch
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|branch| !branch.is_empty())
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Clone,
    Update,
    Skip,
    Delete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Clone => "clone",
            ActionType::Update => "update",
            ActionType::Skip => "skip",
            ActionType::Delete => "delete",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub repo: RepoSpec,
    #[serde(rename = "type")]
    pub kind: ActionType,
    pub strategy: Strategy,
    pub reason: String,
    pub planner: String,
}

impl Action {
    pub fn new(
        repo: RepoSpec,
        kind: ActionType,
        strategy: Strategy,
        reason: impl Into<String>,
        planner: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            kind,
            strategy,
            reason: reason.into(),
            planner: planner.into(),
        }
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.kind, self.repo.path.display())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn count(&self, kind: ActionType) -> usize {
        self.actions.iter().filter(|action| action.kind == kind).count()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Succeeded,
    Failed,
    Skipped,
}

/// Outcome of one action. `error` is set exactly when `kind` is `Failed`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: Action,
    pub kind: ResultKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResult {
    pub fn succeeded(action: Action, message: impl Into<String>) -> Self {
        Self {
            action,
            kind: ResultKind::Succeeded,
            message: message.into(),
            error: None,
        }
    }

    pub fn skipped(action: Action, message: impl Into<String>) -> Self {
        Self {
            action,
            kind: ResultKind::Skipped,
            message: message.into(),
            error: None,
        }
    }

    pub fn failed(action: Action, message: impl Into<String>, err: &anyhow::Error) -> Self {
        Self {
            action,
            kind: ResultKind::Failed,
            message: message.into(),
            error: Some(format!("{err:#}")),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub succeeded: Vec<ActionResult>,
    pub failed: Vec<ActionResult>,
    pub skipped: Vec<ActionResult>,
}

impl ExecutionResult {
    pub fn record(&mut self, result: ActionResult) {
        match result.kind {
            ResultKind::Succeeded => self.succeeded.push(result),
            ResultKind::Failed => self.failed.push(result),
            ResultKind::Skipped => self.skipped.push(result),
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunStateItem {
    pub name: String,
    pub path: PathBuf,
    pub status: RunStatus,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub items: Vec<RunStateItem>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn item(&self, path: &std::path::Path) -> Option<&RunStateItem> {
        self.items.iter().find(|item| item.path == path)
    }

    /// Inserts or replaces the item keyed by its target path.
    pub fn upsert(&mut self, item: RunStateItem) {
        match self.items.iter_mut().find(|existing| existing.path == item.path) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }

    pub fn is_done(&self, path: &std::path::Path) -> bool {
        self.item(path)
            .is_some_and(|item| item.status == RunStatus::Done)
    }
}

/// Current UTC time as RFC 3339, empty if formatting fails.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}
