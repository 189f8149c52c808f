pub mod audit;
pub mod auth;
pub mod cancel;
pub mod config;
pub mod diagnostic;
pub mod diagnostic_executor;
pub mod error;
pub mod executor;
mod executor_action;
pub mod git;
pub mod git_command;
pub mod model;
pub mod paths;
pub mod planner;
pub mod planner_forge;
pub mod planner_fs;
pub mod planner_static;
pub mod runner;
pub mod state;

pub use cancel::CancelToken;
pub use error::{FleetError, RunError};
