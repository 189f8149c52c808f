use crate::cancel::CancelToken;
use crate::error::RunError;
use crate::executor_action::{SKIP_MESSAGE, cancelled_result, run_action};
use crate::git::{GitCli, GitOps};
use crate::model::{
    Action, ActionResult, ActionType, ExecutionResult, Plan, ResultKind, RunState, RunStateItem,
    RunStatus, now_rfc3339,
};
use crate::state::StateStore;
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_PARALLELISM: usize = 4;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Worker count; zero falls back to [`DEFAULT_PARALLELISM`].
    pub parallelism: usize,
    pub max_retries: u32,
    /// Attempt `n` waits `n * retry_backoff` before retrying.
    #[serde(with = "duration_secs")]
    pub retry_backoff: Duration,
    pub dry_run: bool,
    /// Fail the action when no requested branch can be checked out.
    pub strict_branch: bool,
    pub resume: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            dry_run: false,
            strict_branch: false,
            resume: false,
        }
    }
}

impl RunOptions {
    pub fn workers(&self) -> usize {
        if self.parallelism == 0 {
            DEFAULT_PARALLELISM
        } else {
            self.parallelism
        }
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Receives per-action lifecycle callbacks: `on_start`, any number of
/// `on_progress`, then exactly one `on_complete`. Calls for different
/// actions interleave; key off the action's path, not arrival order.
pub trait ProgressSink {
    fn on_start(&self, _action: &Action) {}

    fn on_progress(&self, _action: &Action, _message: &str, _fraction: f32) {}

    fn on_complete(&self, _result: &ActionResult) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NopProgress;

impl ProgressSink for NopProgress {}

pub trait Executor: Send + Sync {
    /// Runs every action in `plan`. Per-action failures land in the result;
    /// only a failed state save makes the call itself fail.
    fn execute(
        &self,
        ctx: &CancelToken,
        plan: Plan,
        options: &RunOptions,
        progress: &dyn ProgressSink,
        state: &dyn StateStore,
    ) -> Result<ExecutionResult, RunError>;
}

enum ActionEvent {
    Started {
        index: usize,
    },
    Progress {
        index: usize,
        message: String,
        fraction: f32,
    },
    Finished {
        index: usize,
        result: ActionResult,
    },
}

/// Executes plans against real checkouts with a fixed pool of worker threads.
pub struct GitExecutor {
    git: Arc<dyn GitOps>,
}

impl GitExecutor {
    pub fn new(git: Arc<dyn GitOps>) -> Self {
        Self { git }
    }
}

impl Default for GitExecutor {
    fn default() -> Self {
        Self::new(Arc::new(GitCli::new()))
    }
}

fn status_for(result: &ActionResult, dry_run: bool) -> RunStatus {
    match result.kind {
        ResultKind::Failed => RunStatus::Failed,
        ResultKind::Skipped if dry_run => RunStatus::Pending,
        ResultKind::Succeeded | ResultKind::Skipped => RunStatus::Done,
    }
}

fn state_item(action: &Action, status: RunStatus, message: &str) -> RunStateItem {
    RunStateItem {
        name: action.repo.name.clone(),
        path: action.repo.path.clone(),
        status,
        message: message.to_string(),
    }
}

/// Saves the mirrored run state, turning a save failure into [`RunError::Persist`].
fn persist(
    state: &dyn StateStore,
    mut run_state: RunState,
    result: ExecutionResult,
) -> Result<ExecutionResult, RunError> {
    run_state.updated_at = now_rfc3339();
    match state.save(&run_state) {
        Ok(()) => Ok(result),
        Err(cause) => {
            warn!(error = %format!("{cause:#}"), "failed to save run state");
            Err(RunError::Persist {
                result: Box::new(result),
                cause,
            })
        }
    }
}

impl Executor for GitExecutor {
    fn execute(
        &self,
        ctx: &CancelToken,
        plan: Plan,
        options: &RunOptions,
        progress: &dyn ProgressSink,
        state: &dyn StateStore,
    ) -> Result<ExecutionResult, RunError> {
        let actions = plan.actions;
        let mut run_state = RunState::new(Uuid::new_v4().to_string());
        let mut result = ExecutionResult::default();
        if actions.is_empty() {
            return persist(state, run_state, result);
        }

        let workers = options.workers().min(actions.len());
        info!(
            run_id = %run_state.run_id,
            actions = actions.len(),
            workers,
            dry_run = options.dry_run,
            "executing plan"
        );

        let actions = &actions;
        let git = self.git.as_ref();
        let (work_tx, work_rx) = mpsc::sync_channel::<usize>(workers);
        let work_rx = Mutex::new(work_rx);
        let (event_tx, event_rx) = mpsc::channel::<ActionEvent>();

        thread::scope(|scope| {
            let producer_events = event_tx.clone();
            scope.spawn(move || {
                for index in 0..actions.len() {
                    if let Err(cause) = ctx.check() {
                        info!(remaining = actions.len() - index, "run cancelled; not starting remaining actions");
                        for skipped in index..actions.len() {
                            let _ = producer_events.send(ActionEvent::Started { index: skipped });
                            let _ = producer_events.send(ActionEvent::Finished {
                                index: skipped,
                                result: cancelled_result(&actions[skipped], cause.clone()),
                            });
                        }
                        break;
                    }
                    if work_tx.send(index).is_err() {
                        break;
                    }
                }
            });

            for _ in 0..workers {
                let work_rx = &work_rx;
                let events = event_tx.clone();
                scope.spawn(move || {
                    loop {
                        let next = match work_rx.lock() {
                            Ok(guard) => guard.recv(),
                            Err(_) => break,
                        };
                        let Ok(index) = next else {
                            break;
                        };
                        let action = &actions[index];
                        let _ = events.send(ActionEvent::Started { index });
                        let result = match ctx.check() {
                            Err(cause) => cancelled_result(action, cause),
                            Ok(()) => {
                                let progress_events = events.clone();
                                let mut report = |message: &str, fraction: f32| {
                                    let _ = progress_events.send(ActionEvent::Progress {
                                        index,
                                        message: message.to_string(),
                                        fraction,
                                    });
                                };
                                run_action(git, ctx, action, options, &mut report)
                            }
                        };
                        let _ = events.send(ActionEvent::Finished { index, result });
                    }
                });
            }
            drop(event_tx);

            for event in event_rx {
                match event {
                    ActionEvent::Started { index } => {
                        let action = &actions[index];
                        progress.on_start(action);
                        let status = if options.dry_run {
                            RunStatus::Pending
                        } else {
                            RunStatus::Running
                        };
                        run_state.upsert(state_item(action, status, ""));
                    }
                    ActionEvent::Progress {
                        index,
                        message,
                        fraction,
                    } => progress.on_progress(&actions[index], &message, fraction),
                    ActionEvent::Finished { index, result: outcome } => {
                        let action = &actions[index];
                        let status = status_for(&outcome, options.dry_run);
                        let message = outcome.error.as_deref().unwrap_or(&outcome.message);
                        run_state.upsert(state_item(action, status, message));
                        progress.on_complete(&outcome);
                        result.record(outcome);
                    }
                }
            }
        });

        info!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            "plan executed"
        );
        persist(state, run_state, result)
    }
}

/// Reports every action as skipped without running anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopExecutor;

impl Executor for NoopExecutor {
    fn execute(
        &self,
        _ctx: &CancelToken,
        plan: Plan,
        _options: &RunOptions,
        progress: &dyn ProgressSink,
        state: &dyn StateStore,
    ) -> Result<ExecutionResult, RunError> {
        let mut run_state = RunState::new(Uuid::new_v4().to_string());
        let mut result = ExecutionResult::default();
        for action in plan.actions {
            progress.on_start(&action);
            let message = match action.kind {
                ActionType::Skip => SKIP_MESSAGE.to_string(),
                _ => format!("noop: would {}", action.label()),
            };
            run_state.upsert(state_item(&action, RunStatus::Pending, &message));
            let outcome = ActionResult::skipped(action, message);
            progress.on_complete(&outcome);
            result.record(outcome);
        }
        persist(state, run_state, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::CloneRequest;
    use crate::model::{RepoSpec, Strategy};
    use crate::state::MemoryStateStore;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Succeeds for every repo except those named `bad`.
    #[derive(Default)]
    struct FakeGit {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl GitOps for FakeGit {
        fn clone_or_update(
            &self,
            _ctx: &CancelToken,
            request: &CloneRequest<'_>,
            progress: &mut dyn FnMut(&str, f32),
        ) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            progress("Receiving objects", 1.0);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if request.dest.ends_with("bad") {
                anyhow::bail!("remote hung up");
            }
            Ok("cloned".into())
        }

        fn checkout(&self, _ctx: &CancelToken, _path: &Path, _branch: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }

        fn branch_exists(&self, _path: &Path, _branch: &str) -> anyhow::Result<bool> {
            Ok(false)
        }

        fn configure_remote(&self, _path: &Path, _name: &str, _url: &str) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    /// Records the callback sequence per repo.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, &'static str)>>,
    }

    impl Recorder {
        fn for_repo(&self, name: &str) -> Vec<&'static str> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(repo, _)| repo == name)
                .map(|(_, event)| *event)
                .collect()
        }
    }

    impl ProgressSink for Recorder {
        fn on_start(&self, action: &Action) {
            self.events.lock().unwrap().push((action.repo.name.clone(), "start"));
        }

        fn on_progress(&self, action: &Action, _message: &str, _fraction: f32) {
            self.events.lock().unwrap().push((action.repo.name.clone(), "progress"));
        }

        fn on_complete(&self, result: &ActionResult) {
            self.events
                .lock()
                .unwrap()
                .push((result.action.repo.name.clone(), "complete"));
        }
    }

    struct BrokenStore;

    impl StateStore for BrokenStore {
        fn save(&self, _state: &RunState) -> anyhow::Result<()> {
            anyhow::bail!("disk full")
        }

        fn load(&self) -> anyhow::Result<RunState> {
            Ok(RunState::default())
        }
    }

    fn plan_for(tmp: &TempDir, names: &[&str]) -> Plan {
        Plan::new(
            names
                .iter()
                .map(|name| {
                    let kind = if *name == "off" {
                        ActionType::Skip
                    } else {
                        ActionType::Clone
                    };
                    Action::new(
                        RepoSpec::new(*name, format!("https://example.com/{name}.git"), tmp.path().join(name)),
                        kind,
                        Strategy::Reset,
                        "test",
                        "static",
                    )
                })
                .collect(),
        )
    }

    fn fast_options() -> RunOptions {
        RunOptions {
            max_retries: 0,
            retry_backoff: Duration::from_millis(1),
            ..RunOptions::default()
        }
    }

    #[test]
    fn partitions_every_action_and_mirrors_state() {
        let tmp = TempDir::new().unwrap();
        let git = Arc::new(FakeGit::default());
        let executor = GitExecutor::new(git.clone());
        let store = MemoryStateStore::new();
        let recorder = Recorder::default();

        let result = executor
            .execute(
                &CancelToken::new(),
                plan_for(&tmp, &["a", "b", "bad", "off"]),
                &fast_options(),
                &recorder,
                &store,
            )
            .unwrap();

        assert_eq!(result.total(), 4);
        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(recorder.for_repo("a"), vec!["start", "progress", "complete"]);
        assert_eq!(recorder.for_repo("off"), vec!["start", "complete"]);

        let saved = store.load().unwrap();
        assert!(!saved.run_id.is_empty());
        assert!(!saved.updated_at.is_empty());
        assert!(saved.is_done(&tmp.path().join("a")));
        assert!(saved.is_done(&tmp.path().join("off")));
        assert_eq!(
            saved.item(&tmp.path().join("bad")).unwrap().status,
            RunStatus::Failed
        );
    }

    #[test]
    fn worker_pool_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let git = Arc::new(FakeGit::default());
        let executor = GitExecutor::new(git.clone());
        let names: Vec<String> = (0..12).map(|n| format!("r{n}")).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let options = RunOptions {
            parallelism: 3,
            ..fast_options()
        };
        let result = executor
            .execute(
                &CancelToken::new(),
                plan_for(&tmp, &names),
                &options,
                &NopProgress,
                &MemoryStateStore::new(),
            )
            .unwrap();
        assert_eq!(result.succeeded.len(), 12);
        assert!(git.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn zero_parallelism_uses_default() {
        let options = RunOptions {
            parallelism: 0,
            ..RunOptions::default()
        };
        assert_eq!(options.workers(), DEFAULT_PARALLELISM);
    }

    #[test]
    fn cancelled_run_reports_every_action_as_failed() {
        let tmp = TempDir::new().unwrap();
        let git = Arc::new(FakeGit::default());
        let ctx = CancelToken::new();
        ctx.cancel();
        let recorder = Recorder::default();
        let result = GitExecutor::new(git.clone())
            .execute(
                &ctx,
                plan_for(&tmp, &["a", "b", "c"]),
                &fast_options(),
                &recorder,
                &MemoryStateStore::new(),
            )
            .unwrap();
        assert_eq!(result.failed.len(), 3);
        assert_eq!(git.calls.load(Ordering::SeqCst), 0);
        assert!(
            result.failed[0]
                .error
                .as_deref()
                .unwrap()
                .contains("cancelled")
        );
        assert_eq!(recorder.for_repo("b"), vec!["start", "complete"]);
    }

    #[test]
    fn dry_run_records_pending_and_skips() {
        let tmp = TempDir::new().unwrap();
        let git = Arc::new(FakeGit::default());
        let store = MemoryStateStore::new();
        let options = RunOptions {
            dry_run: true,
            ..fast_options()
        };
        let result = GitExecutor::new(git.clone())
            .execute(&CancelToken::new(), plan_for(&tmp, &["a"]), &options, &NopProgress, &store)
            .unwrap();
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(git.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            store.load().unwrap().item(&tmp.path().join("a")).unwrap().status,
            RunStatus::Pending
        );
    }

    #[test]
    fn save_failure_keeps_results() {
        let tmp = TempDir::new().unwrap();
        let err = GitExecutor::new(Arc::new(FakeGit::default()))
            .execute(
                &CancelToken::new(),
                plan_for(&tmp, &["a", "bad"]),
                &fast_options(),
                &NopProgress,
                &BrokenStore,
            )
            .unwrap_err();
        let partial = err.partial_result().unwrap();
        assert_eq!(partial.total(), 2);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn empty_plan_still_saves_state() {
        let store = MemoryStateStore::new();
        let result = GitExecutor::new(Arc::new(FakeGit::default()))
            .execute(&CancelToken::new(), Plan::default(), &fast_options(), &NopProgress, &store)
            .unwrap();
        assert_eq!(result.total(), 0);
        assert!(!store.load().unwrap().run_id.is_empty());
    }

    #[test]
    fn noop_executor_skips_everything() {
        let tmp = TempDir::new().unwrap();
        let recorder = Recorder::default();
        let result = NoopExecutor
            .execute(
                &CancelToken::new(),
                plan_for(&tmp, &["a", "off"]),
                &RunOptions::default(),
                &recorder,
                &MemoryStateStore::new(),
            )
            .unwrap();
        assert_eq!(result.skipped.len(), 2);
        assert!(result.skipped[0].message.starts_with("noop: would clone"));
        assert_eq!(recorder.for_repo("a"), vec!["start", "complete"]);
        assert!(!tmp.path().join("a").exists());
    }

    #[test]
    fn run_options_round_trip_backoff_as_seconds() {
        let json = serde_json::to_string(&RunOptions::default()).unwrap();
        assert!(json.contains("\"retry_backoff\":2.0"));
        let parsed: RunOptions = serde_json::from_str(r#"{"retry_backoff":0.5,"parallelism":8}"#).unwrap();
        assert_eq!(parsed.retry_backoff, Duration::from_millis(500));
        assert_eq!(parsed.parallelism, 8);
        assert_eq!(parsed.max_retries, DEFAULT_MAX_RETRIES);
    }
}
