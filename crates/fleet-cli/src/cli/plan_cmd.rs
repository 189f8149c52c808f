use super::args::PlanArgs;
use super::shared::{build_planner, print_plan};
use fleet_core::CancelToken;
use fleet_core::config::FleetConfig;
use fleet_core::model::ActionType;
use fleet_core::runner::Runner;

pub(super) fn handle_plan(ctx: &CancelToken, config: &FleetConfig, args: PlanArgs) -> anyhow::Result<()> {
    let runner = Runner::new()
        .planner(build_planner(config)?)
        .default_strategy(config.defaults.strategy);
    let request = config.plan_request(args.cleanup)?;
    let plan = runner.plan(ctx, &request)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }
    print_plan(&plan);
    println!(
        "Clone: {}  Update: {}  Delete: {}  Skip: {}",
        plan.count(ActionType::Clone),
        plan.count(ActionType::Update),
        plan.count(ActionType::Delete),
        plan.count(ActionType::Skip)
    );
    Ok(())
}
