use crate::cancel::CancelToken;
use crate::model::{Action, ActionType, Plan, RepoSpec};
use crate::planner::{PlanOptions, Planner, unique_targets};

pub const STATIC_PLANNER: &str = "static";

/// Plans without touching disk: every repo is cloned unless it declares
/// itself `present`, in which case it is updated.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticPlanner;

impl StaticPlanner {
    pub fn new() -> Self {
        Self
    }
}

impl Planner for StaticPlanner {
    fn name(&self) -> &'static str {
        STATIC_PLANNER
    }

    fn plan(
        &self,
        ctx: &CancelToken,
        desired: &[RepoSpec],
        options: &PlanOptions,
    ) -> anyhow::Result<Plan> {
        ctx.check()?;
        let actions = unique_targets(desired)
            .into_iter()
            .map(|repo| {
                let (kind, reason) = if !repo.enabled() {
                    (ActionType::Skip, "disabled")
                } else if repo.present {
                    (ActionType::Update, "declared present")
                } else {
                    (ActionType::Clone, "not declared present")
                };
                Action::new(
                    repo.clone(),
                    kind,
                    options.strategy_for(repo),
                    reason,
                    STATIC_PLANNER,
                )
            })
            .collect();
        Ok(Plan::new(actions))
    }
}
