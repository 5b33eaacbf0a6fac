//! Procedure lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a procedure.
///
/// State transitions:
/// - Initialized -> WillEnqueue -> Pending -> (EvaluatingConditions) -> Ready -> Executing -> (WaitingForProduced) -> Finishing -> Finished
/// - Pending / EvaluatingConditions / Ready -> Finishing (only when cancelled)
///
/// Design note: the variants are declared in lifecycle order so `Ord` doubles
/// as "has the procedure reached at least this point".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureState {
    /// Created, still being configured.
    Initialized,

    /// A queue accepted it and is wiring it up.
    WillEnqueue,

    /// Waiting for dependencies.
    Pending,

    /// Conditions are being evaluated.
    EvaluatingConditions,

    /// All gates cleared; waiting for a concurrency slot.
    Ready,

    /// The work is running.
    Executing,

    /// The work returned; waiting for the procedures it produced. Holds no
    /// concurrency slot.
    WaitingForProduced,

    /// `finish` was accepted; will-finish notifications in flight.
    Finishing,

    /// Terminal.
    Finished,
}

impl ProcedureState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcedureState::Finished)
    }

    /// Has the procedure been handed to a queue?
    pub fn is_enqueued(self) -> bool {
        self >= ProcedureState::WillEnqueue
    }

    /// Is the transition `self -> to` legal?
    ///
    /// Cancellation is the only side channel: a cancelled procedure may jump
    /// from any pre-execution state straight to `Finishing`.
    pub fn can_transition(self, to: ProcedureState, cancelled: bool) -> bool {
        use ProcedureState::*;
        match (self, to) {
            (Initialized, WillEnqueue) => true,
            (WillEnqueue, Pending) => true,
            (Pending, EvaluatingConditions) => true,
            (Pending, Ready) => true,
            (EvaluatingConditions, Ready) => true,
            (Ready, Executing) => true,
            (Executing, Finishing) => true,
            (Executing, WaitingForProduced) => true,
            (WaitingForProduced, Finishing) => true,
            (Finishing, Finished) => true,
            (Pending | EvaluatingConditions | Ready, Finishing) => cancelled,
            _ => false,
        }
    }
}

impl fmt::Display for ProcedureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcedureState::Initialized => "initialized",
            ProcedureState::WillEnqueue => "will_enqueue",
            ProcedureState::Pending => "pending",
            ProcedureState::EvaluatingConditions => "evaluating_conditions",
            ProcedureState::Ready => "ready",
            ProcedureState::Executing => "executing",
            ProcedureState::WaitingForProduced => "waiting_for_produced",
            ProcedureState::Finishing => "finishing",
            ProcedureState::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// Coarse status for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcedureStatus {
    Pending,
    Executing,
    Cancelled,
    Failed,
    Finished,
}

impl ProcedureStatus {
    /// Derive the status from the raw state fields.
    ///
    /// `Failed` and `Cancelled` are only reported once the procedure finished,
    /// so a cancelled procedure still draining its dependencies reads as
    /// `Pending`. So does a producer waiting for what it produced: it no
    /// longer counts against the concurrency limit.
    pub fn from_parts(state: ProcedureState, cancelled: bool, has_errors: bool) -> Self {
        match state {
            ProcedureState::Finished if has_errors => ProcedureStatus::Failed,
            ProcedureState::Finished if cancelled => ProcedureStatus::Cancelled,
            ProcedureState::Finished => ProcedureStatus::Finished,
            ProcedureState::Executing | ProcedureState::Finishing => ProcedureStatus::Executing,
            _ => ProcedureStatus::Pending,
        }
    }
}
