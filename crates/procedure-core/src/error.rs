use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::domain::{ProcedureId, ProcedureState};

/// Errors a procedure can finish with, plus the API misuse errors.
///
/// Design: every variant is `Clone` so one error value can be handed to the
/// procedure, its observers, its parent group and a retry history at once.
/// Foreign errors go through `Custom`, which shares them behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum ProcedureError {
    #[error("condition `{condition}` failed: {reason}")]
    ConditionFailed { condition: String, reason: String },

    #[error("condition `{condition}` evaluated to false")]
    FalseCondition { condition: String },

    #[error("{} conditions failed", errors.len())]
    FailedConditions { errors: Vec<ProcedureError> },

    #[error("dependencies of condition `{condition}` failed")]
    ConditionDependenciesFailed { condition: String },

    #[error("dependencies of condition `{condition}` were cancelled")]
    ConditionDependenciesCancelled { condition: String },

    #[error("condition evaluation was cancelled")]
    ConditionEvaluationCancelled,

    #[error("dependency {procedure} finished with errors")]
    DependenciesFailed { procedure: ProcedureId },

    #[error("dependency {procedure} was cancelled")]
    DependenciesCancelled { procedure: ProcedureId },

    #[error("requirement of {procedure} was not satisfied")]
    RequirementNotSatisfied { procedure: ProcedureId },

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("parent cancelled: {cause}")]
    ParentCancelled { cause: Box<ProcedureError> },

    #[error("illegal transition of {procedure}: {from} -> {to}")]
    InvalidTransition {
        procedure: ProcedureId,
        from: ProcedureState,
        to: ProcedureState,
    },

    #[error("{procedure} is already enqueued")]
    AlreadyEnqueued { procedure: ProcedureId },

    #[error("{procedure} is not attached to a queue")]
    NotEnqueued { procedure: ProcedureId },

    #[error("group {group} is finishing and cannot accept children")]
    GroupFinishing { group: ProcedureId },

    #[error("dependency cycle: {}", format_cycle(cycle))]
    DependencyCycle { cycle: Vec<ProcedureId> },

    #[error("no tokio runtime available to drive procedures")]
    NoRuntime,

    #[error("{message}")]
    Failed { message: String },

    #[error(transparent)]
    Custom(Arc<dyn std::error::Error + Send + Sync>),
}

impl ProcedureError {
    /// Shorthand for a plain message error.
    pub fn failed(message: impl Into<String>) -> Self {
        ProcedureError::Failed {
            message: message.into(),
        }
    }

    /// Wrap any foreign error.
    pub fn custom<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ProcedureError::Custom(Arc::new(error))
    }

    /// Flatten aggregated condition failures into one error per condition.
    pub fn flatten(self) -> Vec<ProcedureError> {
        match self {
            ProcedureError::FailedConditions { errors } => {
                errors.into_iter().flat_map(ProcedureError::flatten).collect()
            }
            other => vec![other],
        }
    }

    /// Is this an API misuse rather than a failure of the work itself?
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            ProcedureError::InvalidTransition { .. }
                | ProcedureError::AlreadyEnqueued { .. }
                | ProcedureError::NotEnqueued { .. }
                | ProcedureError::GroupFinishing { .. }
                | ProcedureError::DependencyCycle { .. }
        )
    }
}

fn format_cycle(cycle: &[ProcedureId]) -> String {
    cycle
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_unwraps_nested_failures() {
        let nested = ProcedureError::FailedConditions {
            errors: vec![
                ProcedureError::failed("a"),
                ProcedureError::FailedConditions {
                    errors: vec![ProcedureError::failed("b"), ProcedureError::failed("c")],
                },
            ],
        };

        let messages: Vec<String> = nested.flatten().iter().map(ToString::to_string).collect();
        assert_eq!(messages, vec!["a", "b", "c"]);
    }

    #[test]
    fn custom_errors_keep_their_message() {
        let io = std::io::Error::other("disk on fire");
        let err = ProcedureError::custom(io);
        assert_eq!(err.to_string(), "disk on fire");
        assert!(!err.is_programming_error());
    }

    #[test]
    fn cycle_is_rendered_in_order() {
        let a = ProcedureId::generate();
        let b = ProcedureId::generate();
        let err = ProcedureError::DependencyCycle { cycle: vec![a, b, a] };
        assert_eq!(err.to_string(), format!("dependency cycle: {a} -> {b} -> {a}"));
        assert!(err.is_programming_error());
    }
}
