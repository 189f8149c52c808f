use crate::cancel::CancelToken;
use crate::error::{FleetError, RunError};
use crate::executor::{Executor, ProgressSink, RunOptions};
use crate::model::{ExecutionResult, Plan, RunState, Strategy};
use crate::planner::{PlanRequest, Planner};
use crate::state::{MemoryStateStore, ResumeStateStore, StateStore};
use anyhow::Context;
use std::sync::Arc;
use tracing::info;

/// Plans, optionally filters against a previous run, then executes.
#[derive(Clone, Default)]
pub struct Runner {
    planner: Option<Arc<dyn Planner>>,
    executor: Option<Arc<dyn Executor>>,
    state: Option<Arc<dyn StateStore>>,
    default_strategy: Strategy,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn state(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    /// Strategy filled into requests that leave it unset.
    pub fn default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn plan(&self, ctx: &CancelToken, request: &PlanRequest) -> anyhow::Result<Plan> {
        let planner = self
            .planner
            .as_ref()
            .ok_or(FleetError::MissingDependency("planner"))?;
        let mut options = request.options.clone();
        options.default_strategy.get_or_insert(self.default_strategy);
        let plan = planner.plan(ctx, &request.repos, &options)?;
        info!(planner = planner.name(), actions = plan.len(), "plan ready");
        Ok(plan)
    }

    pub fn run(
        &self,
        ctx: &CancelToken,
        request: &PlanRequest,
        options: &RunOptions,
        progress: &dyn ProgressSink,
    ) -> Result<ExecutionResult, RunError> {
        if self.planner.is_none() {
            return Err(FleetError::MissingDependency("planner").into());
        }
        let executor = self
            .executor
            .as_ref()
            .ok_or(FleetError::MissingDependency("executor"))?;
        let store: Arc<dyn StateStore> = match &self.state {
            Some(state) => Arc::clone(state),
            None => Arc::new(MemoryStateStore::new()),
        };

        let previous = if options.resume {
            Some(store.load().context("load run state for resume")?)
        } else {
            None
        };

        let plan = self.plan(ctx, request)?;
        let (plan, store) = match previous {
            Some(previous) => {
                let plan = filter_completed(plan, &previous);
                let store: Arc<dyn StateStore> = Arc::new(ResumeStateStore::new(store, previous));
                (plan, store)
            }
            None => (plan, store),
        };

        executor.execute(ctx, plan, options, progress, store.as_ref())
    }
}

/// Drops actions whose target path finished in `previous`. Unknown and
/// unfinished paths stay in the plan.
pub fn filter_completed(plan: Plan, previous: &RunState) -> Plan {
    let before = plan.len();
    let actions: Vec<_> = plan
        .actions
        .into_iter()
        .filter(|action| !previous.is_done(&action.repo.path))
        .collect();
    if actions.len() != before {
        info!(
            resumed = before - actions.len(),
            remaining = actions.len(),
            "skipping actions completed in previous run"
        );
    }
    Plan::new(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{NoopExecutor, NopProgress};
    use crate::model::{RepoSpec, RunStateItem, RunStatus};
    use crate::planner::PlanOptions;
    use crate::planner_static::StaticPlanner;
    use std::sync::Mutex;

    /// Captures the plan it receives.
    #[derive(Default)]
    struct CapturingExecutor {
        seen: Mutex<Vec<Plan>>,
    }

    impl Executor for CapturingExecutor {
        fn execute(
            &self,
            ctx: &CancelToken,
            plan: Plan,
            options: &RunOptions,
            progress: &dyn ProgressSink,
            state: &dyn StateStore,
        ) -> Result<ExecutionResult, RunError> {
            self.seen.lock().unwrap().push(plan.clone());
            NoopExecutor.execute(ctx, plan, options, progress, state)
        }
    }

    fn request() -> PlanRequest {
        PlanRequest {
            repos: vec![
                RepoSpec::new("a", "https://x/a.git", "/r/a"),
                RepoSpec::new("b", "https://x/b.git", "/r/b"),
                RepoSpec::new("c", "https://x/c.git", "/r/c"),
            ],
            options: PlanOptions::default(),
        }
    }

    fn item(path: &str, status: RunStatus) -> RunStateItem {
        RunStateItem {
            name: String::new(),
            path: path.into(),
            status,
            message: String::new(),
        }
    }

    #[test]
    fn missing_dependencies_fail_fast() {
        let err = Runner::new()
            .executor(Arc::new(NoopExecutor))
            .run(&CancelToken::new(), &request(), &RunOptions::default(), &NopProgress)
            .unwrap_err();
        assert!(err.to_string().contains("planner"));

        let err = Runner::new()
            .planner(Arc::new(StaticPlanner::new()))
            .run(&CancelToken::new(), &request(), &RunOptions::default(), &NopProgress)
            .unwrap_err();
        assert!(err.to_string().contains("executor"));
    }

    #[test]
    fn default_strategy_is_applied() {
        let runner = Runner::new()
            .planner(Arc::new(StaticPlanner::new()))
            .default_strategy(Strategy::Fetch);
        let plan = runner.plan(&CancelToken::new(), &request()).unwrap();
        assert!(plan.actions.iter().all(|action| action.strategy == Strategy::Fetch));
    }

    #[test]
    fn resume_drops_only_done_paths() {
        let mut previous = RunState::new("run-1");
        previous.upsert(item("/r/a", RunStatus::Done));
        previous.upsert(item("/r/b", RunStatus::Failed));
        let store = Arc::new(MemoryStateStore::with_state(previous));
        let executor = Arc::new(CapturingExecutor::default());
        let runner = Runner::new()
            .planner(Arc::new(StaticPlanner::new()))
            .executor(executor.clone())
            .state(store.clone());
        let options = RunOptions {
            resume: true,
            ..RunOptions::default()
        };

        runner
            .run(&CancelToken::new(), &request(), &options, &NopProgress)
            .unwrap();

        let seen = executor.seen.lock().unwrap();
        let paths: Vec<_> = seen[0]
            .actions
            .iter()
            .map(|action| action.repo.path.display().to_string())
            .collect();
        assert_eq!(paths, vec!["/r/b", "/r/c"]);

        let saved = store.load().unwrap();
        assert!(saved.is_done(std::path::Path::new("/r/a")));
        assert_eq!(saved.items.len(), 3);
    }

    #[test]
    fn without_resume_nothing_is_filtered() {
        let mut previous = RunState::new("run-1");
        previous.upsert(item("/r/a", RunStatus::Done));
        let executor = Arc::new(CapturingExecutor::default());
        Runner::new()
            .planner(Arc::new(StaticPlanner::new()))
            .executor(executor.clone())
            .state(Arc::new(MemoryStateStore::with_state(previous)))
            .run(&CancelToken::new(), &request(), &RunOptions::default(), &NopProgress)
            .unwrap();
        assert_eq!(executor.seen.lock().unwrap()[0].len(), 3);
    }
}
