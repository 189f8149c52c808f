use crate::model::ExecutionResult;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Clone, Debug, Error)]
pub enum FleetError {
    #[error("no repositories to plan")]
    NoRepositories,

    #[error("repo {0} has no clone url")]
    MissingCloneUrl(String),

    #[error("repo {0} has no target path")]
    MissingTargetPath(String),

    #[error("unknown strategy {0:?} (expected reset, pull or fetch)")]
    UnknownStrategy(String),

    #[error("unsafe path separator {0:?}")]
    UnsafeSeparator(String),

    #[error("clone target {} already holds a repository", .0.display())]
    TargetIsRepository(PathBuf),

    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    #[error("ssh key not found: {}", .0.display())]
    SshKeyNotFound(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl FleetError {
    /// True when `err` (anywhere in its chain) is a cancellation or deadline.
    pub fn is_cancellation(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<FleetError>(),
                Some(FleetError::Cancelled | FleetError::DeadlineExceeded)
            )
        })
    }

    pub fn is_deadline(err: &anyhow::Error) -> bool {
        err.chain().any(|cause| {
            matches!(
                cause.downcast_ref::<FleetError>(),
                Some(FleetError::DeadlineExceeded)
            )
        })
    }
}

/// Failure of a whole `execute`/`run` call.
///
/// `Persist` keeps the per-action outcomes: every action already ran, only
/// saving the run state failed.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    #[error("save run state: {cause:#}")]
    Persist {
        result: Box<ExecutionResult>,
        cause: anyhow::Error,
    },
}

impl RunError {
    pub fn partial_result(&self) -> Option<&ExecutionResult> {
        match self {
            RunError::Persist { result, .. } => Some(result),
            RunError::Failed(_) => None,
        }
    }

    pub fn into_partial_result(self) -> Option<ExecutionResult> {
        match self {
            RunError::Persist { result, .. } => Some(*result),
            RunError::Failed(_) => None,
        }
    }
}

impl From<FleetError> for RunError {
    fn from(err: FleetError) -> Self {
        RunError::Failed(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn cancellation_is_found_through_context() {
        let err = Err::<(), _>(FleetError::DeadlineExceeded)
            .context("fetch remotes")
            .unwrap_err();
        assert!(FleetError::is_cancellation(&err));
        assert!(FleetError::is_deadline(&err));

        let other = anyhow::anyhow!("boom");
        assert!(!FleetError::is_cancellation(&other));
    }

    #[test]
    fn persist_error_keeps_result() {
        let err = RunError::Persist {
            result: Box::new(ExecutionResult::default()),
            cause: anyhow::anyhow!("disk full"),
        };
        assert!(err.partial_result().is_some());
        assert!(err.to_string().contains("disk full"));
    }
}
