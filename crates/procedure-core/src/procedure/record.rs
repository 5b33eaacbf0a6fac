//! Procedure record: the mutable state behind one procedure.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Instant;

use super::{Procedure, ProcedureObserver, WeakProcedure};
use crate::condition::Condition;
use crate::domain::{ProcedureId, ProcedureState};
use crate::error::ProcedureError;
use crate::exclusivity::ExclusivityManager;
use crate::queue::QueueInner;

/// Mutable state of a procedure, guarded by the procedure's lock.
///
/// Design:
/// - This is the single source of truth for the procedure's lifecycle.
/// - All state transitions go through `transition`, which enforces the
///   lifecycle order.
/// - `cancelled` and `errors` are only ever updated together under the lock.
pub(crate) struct ProcedureRecord {
    pub name: String,
    pub state: ProcedureState,
    pub cancelled: bool,

    /// Ordered, append-only once finishing begins.
    pub errors: Vec<ProcedureError>,

    pub dependencies: Vec<Procedure>,

    /// Dependencies produced by conditions; scheduled alongside the procedure.
    pub produced_dependencies: Vec<Procedure>,

    /// Procedures produced by the work itself via `ProcedureContext::produce`.
    pub produced: Vec<WeakProcedure>,

    pub conditions: Vec<Condition>,
    pub observers: Vec<Arc<dyn ProcedureObserver>>,

    /// Non-owning handle to the owning queue, set once enqueued.
    pub queue: Option<Weak<QueueInner>>,

    /// Exclusivity categories currently held, released on finish.
    pub held_locks: Option<(Arc<ExclusivityManager>, BTreeSet<String>)>,

    /// For the elapsed time logged on finish.
    pub created_at: Instant,
}

impl ProcedureRecord {
    pub fn new(name: String) -> Self {
        Self {
            name,
            state: ProcedureState::Initialized,
            cancelled: false,
            errors: Vec::new(),
            dependencies: Vec::new(),
            produced_dependencies: Vec::new(),
            produced: Vec::new(),
            conditions: Vec::new(),
            observers: Vec::new(),
            queue: None,
            held_locks: None,
            created_at: Instant::now(),
        }
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(
        &mut self,
        id: ProcedureId,
        to: ProcedureState,
    ) -> Result<ProcedureState, ProcedureError> {
        let from = self.state;
        if !from.can_transition(to, self.cancelled) {
            return Err(ProcedureError::InvalidTransition {
                procedure: id,
                from,
                to,
            });
        }
        self.state = to;
        Ok(from)
    }

    /// Set the cancelled flag and append the errors in one step.
    ///
    /// Returns false when the procedure was already cancelled or is past the
    /// point where cancellation means anything.
    pub fn mark_cancelled(&mut self, errors: Vec<ProcedureError>) -> bool {
        if self.cancelled || self.state >= ProcedureState::Finishing {
            return false;
        }
        self.cancelled = true;
        self.errors.extend(errors);
        true
    }

    /// Append errors unless the procedure already finished.
    ///
    /// Returns the rejected errors, if any, so the caller can report them.
    pub fn append_errors(&mut self, errors: Vec<ProcedureError>) -> Option<Vec<ProcedureError>> {
        if self.state.is_terminal() {
            return Some(errors);
        }
        self.errors.extend(errors);
        None
    }

    /// Can dependencies and conditions still be attached?
    pub fn is_configurable(&self) -> bool {
        self.state == ProcedureState::Initialized
    }

    pub fn categories(&self) -> BTreeSet<String> {
        self.conditions
            .iter()
            .flat_map(|c| c.mutually_exclusive_categories())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_rejects_skipping_states() {
        let id = ProcedureId::generate();
        let mut record = ProcedureRecord::new("r".into());

        assert!(record.transition(id, ProcedureState::Executing).is_err());
        assert_eq!(record.state, ProcedureState::Initialized);

        assert_eq!(
            record.transition(id, ProcedureState::WillEnqueue).unwrap(),
            ProcedureState::Initialized
        );
        assert_eq!(record.state, ProcedureState::WillEnqueue);
    }

    #[test]
    fn cancel_sets_flag_and_errors_together() {
        let mut record = ProcedureRecord::new("r".into());

        assert!(record.mark_cancelled(vec![ProcedureError::failed("stop")]));
        assert!(record.cancelled);
        assert_eq!(record.errors.len(), 1);

        // second cancel is ignored, including its error
        assert!(!record.mark_cancelled(vec![ProcedureError::failed("again")]));
        assert_eq!(record.errors.len(), 1);
    }

    #[test]
    fn cancel_after_finishing_is_ignored() {
        let mut record = ProcedureRecord::new("r".into());
        record.state = ProcedureState::Finishing;

        assert!(!record.mark_cancelled(vec![]));
        assert!(!record.cancelled);
    }

    #[test]
    fn errors_after_finished_are_rejected() {
        let mut record = ProcedureRecord::new("r".into());
        record.state = ProcedureState::Finishing;
        assert!(record.append_errors(vec![ProcedureError::failed("late")]).is_none());

        record.state = ProcedureState::Finished;
        let rejected = record.append_errors(vec![ProcedureError::failed("too late")]);
        assert_eq!(rejected.map(|e| e.len()), Some(1));
        assert_eq!(record.errors.len(), 1);
    }
}
