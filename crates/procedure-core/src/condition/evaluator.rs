//! Condition evaluation for one procedure.
//!
//! Design:
//! - Conditions are evaluated one after another in attachment order, so a
//!   short-circuit guarantees later conditions are never looked at.
//! - Produced dependencies are scheduled on the owning procedure's queue and
//!   recorded on the procedure; the procedure waits for them before executing.
//! - Cancellation of the owning procedure is observed through its watch
//!   channel and cancels every produced dependency still running.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use super::{Condition, ConditionKind, ConditionResult, RequirementViolation, filter_duplicates};
use crate::domain::ProcedureState;
use crate::error::ProcedureError;
use crate::procedure::Procedure;
use crate::queue::ProcedureQueue;

/// How results of several conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Satisfied and ignored results are collected; the first failure wins.
    And,
    /// The first satisfied result wins; everything else is collected.
    Or,
}

impl Aggregation {
    /// Does `result` end the evaluation of the remaining conditions?
    fn short_circuits(self, result: &ConditionResult) -> bool {
        match self {
            Aggregation::And => result.is_failed(),
            Aggregation::Or => result.is_satisfied(),
        }
    }
}

/// Combine two collected results.
///
/// Two failures merge into `FailedConditions`; a failure replaces anything
/// else; `Ignored` is replaced by anything; otherwise the left side is kept.
pub fn reduce_results(lhs: ConditionResult, rhs: ConditionResult) -> ConditionResult {
    use ConditionResult::*;

    match (lhs, rhs) {
        (Failed(left), Failed(right)) => Failed(merge_failures(left, right)),
        (_, Failed(right)) => Failed(right),
        (Ignored, rhs) => rhs,
        (lhs, _) => lhs,
    }
}

fn merge_failures(left: ProcedureError, right: ProcedureError) -> ProcedureError {
    match (left, right) {
        (ProcedureError::FailedConditions { mut errors }, right) => {
            errors.push(right);
            ProcedureError::FailedConditions { errors }
        }
        (left, ProcedureError::FailedConditions { mut errors }) => {
            errors.push(left);
            ProcedureError::FailedConditions { errors }
        }
        (left, right) => ProcedureError::FailedConditions {
            errors: vec![left, right],
        },
    }
}

/// Evaluate every condition of `procedure` as an implicit AND.
///
/// Returns `Failed(ConditionEvaluationCancelled)` as soon as the procedure is
/// cancelled, after cancelling the produced dependencies still running.
pub(crate) async fn evaluate_conditions(
    procedure: &Procedure,
    queue: &ProcedureQueue,
) -> ConditionResult {
    let conditions = filter_duplicates(procedure.conditions());
    let evaluation = Evaluation {
        procedure,
        queue,
        scheduled: Mutex::new(Vec::new()),
    };

    let result = tokio::select! {
        result = evaluation.all(&conditions, Aggregation::And, false) => result,
        _ = procedure.cancelled() => {
            ConditionResult::Failed(ProcedureError::ConditionEvaluationCancelled)
        }
    };

    let scheduled = evaluation
        .scheduled
        .into_inner()
        .unwrap_or_else(|e| e.into_inner());
    for produced in scheduled.iter().filter(|p| !p.is_finished()) {
        tracing::debug!(
            procedure = %procedure.id(),
            produced = %produced.id(),
            "cancelling outstanding produced dependency"
        );
        produced.cancel();
    }

    tracing::trace!(procedure = %procedure.id(), verdict = ?result, "conditions evaluated");
    result
}

type EvalFuture<'a> = Pin<Box<dyn Future<Output = ConditionResult> + Send + 'a>>;

struct Evaluation<'a> {
    procedure: &'a Procedure,
    queue: &'a ProcedureQueue,
    /// Produced dependencies this evaluation added to the queue.
    scheduled: Mutex<Vec<Procedure>>,
}

impl<'a> Evaluation<'a> {
    async fn all(
        &self,
        conditions: &[Condition],
        aggregation: Aggregation,
        silent: bool,
    ) -> ConditionResult {
        let mut collected = Vec::new();
        for condition in filter_duplicates(conditions.iter().cloned()) {
            let result = self.one(&condition, silent).await;
            let stop = aggregation.short_circuits(&result);
            collected.push(result);
            if stop {
                break;
            }
        }
        collected
            .into_iter()
            .fold(ConditionResult::Ignored, reduce_results)
    }

    /// Boxed because compound and composed conditions recurse.
    fn one<'c>(&'c self, condition: &'c Condition, silent: bool) -> EvalFuture<'c> {
        Box::pin(async move {
            let mut waits = condition.dependencies();
            if !silent {
                for produced in condition.produced_dependencies() {
                    if let Err(err) = self.schedule(&produced) {
                        return ConditionResult::Failed(err);
                    }
                    waits.push(produced);
                }
            }
            for dependency in &waits {
                dependency.wait().await;
            }

            match condition.requirements().verify(&waits) {
                Ok(()) => {}
                Err(RequirementViolation::Failed) => {
                    return ConditionResult::Failed(ProcedureError::ConditionDependenciesFailed {
                        condition: condition.name(),
                    });
                }
                Err(RequirementViolation::Cancelled) => {
                    return ConditionResult::Failed(
                        ProcedureError::ConditionDependenciesCancelled {
                            condition: condition.name(),
                        },
                    );
                }
            }

            self.evaluate_kind(condition, silent).await
        })
    }

    async fn evaluate_kind(&self, condition: &Condition, silent: bool) -> ConditionResult {
        match condition.kind() {
            ConditionKind::True | ConditionKind::MutuallyExclusive => ConditionResult::Satisfied,
            ConditionKind::False => ConditionResult::Failed(ProcedureError::FalseCondition {
                condition: condition.name(),
            }),
            ConditionKind::Block(predicate) => match predicate(self.procedure) {
                Ok(true) => ConditionResult::Satisfied,
                Ok(false) => ConditionResult::Failed(ProcedureError::FalseCondition {
                    condition: condition.name(),
                }),
                Err(err) => ConditionResult::Failed(ProcedureError::ConditionFailed {
                    condition: condition.name(),
                    reason: err.to_string(),
                }),
            },
            ConditionKind::NoFailedDependencies {
                ignore_cancellations,
            } => no_failed_dependencies(self.procedure, *ignore_cancellations),
            ConditionKind::Custom(evaluate) => evaluate.evaluate(self.procedure).await,
            ConditionKind::Compound(aggregation, children) => {
                self.all(children, *aggregation, silent).await
            }
            ConditionKind::Negated(inner) => match self.one(inner, silent).await {
                ConditionResult::Satisfied => {
                    ConditionResult::Failed(ProcedureError::FalseCondition {
                        condition: condition.name(),
                    })
                }
                ConditionResult::Failed(_) => ConditionResult::Satisfied,
                ConditionResult::Ignored => ConditionResult::Ignored,
            },
            ConditionKind::Silent(inner) => self.one(inner, true).await,
            ConditionKind::Ignored(inner) => match self.one(inner, silent).await {
                ConditionResult::Failed(err) => {
                    tracing::trace!(condition = %condition.name(), error = %err, "failure ignored");
                    ConditionResult::Ignored
                }
                other => other,
            },
        }
    }

    /// Add a produced dependency to the owning queue, once.
    fn schedule(&self, produced: &Procedure) -> Result<(), ProcedureError> {
        self.procedure.add_produced_dependency(produced);
        if produced.state() != ProcedureState::Initialized {
            return Ok(());
        }
        self.queue.add(produced.clone())?;
        tracing::debug!(
            procedure = %self.procedure.id(),
            produced = %produced.id(),
            "scheduled condition dependency"
        );
        self.scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(produced.clone());
        Ok(())
    }
}

fn no_failed_dependencies(procedure: &Procedure, ignore_cancellations: bool) -> ConditionResult {
    let dependencies = procedure.dependencies();

    if ignore_cancellations && dependencies.iter().any(Procedure::is_cancelled) {
        return ConditionResult::Ignored;
    }
    if let Some(failed) = dependencies.iter().find(|d| d.has_errors()) {
        return ConditionResult::Failed(ProcedureError::DependenciesFailed {
            procedure: failed.id(),
        });
    }
    if let Some(cancelled) = dependencies.iter().find(|d| d.is_cancelled()) {
        return ConditionResult::Failed(ProcedureError::DependenciesCancelled {
            procedure: cancelled.id(),
        });
    }
    ConditionResult::Satisfied
}
