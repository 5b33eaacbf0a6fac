//! Work trait: the extension point a procedure executes.

use async_trait::async_trait;

use super::{Procedure, ProcedureContext};
use crate::error::ProcedureError;

/// The body of a procedure.
///
/// Design intent:
/// - The queue owns scheduling and state transitions.
/// - `Work` only does the job and reports the result; returning from
///   `execute` finishes the procedure (an earlier explicit `finish` wins).
/// - Composite procedures (groups, retry) are `Work` implementations that
///   own their own private queue, instead of a subclass hierarchy.
#[async_trait]
pub trait Work: Send + Sync + 'static {
    /// Run the work. Called at most once, never while cancelled unless
    /// `runs_when_cancelled` says otherwise.
    async fn execute(&self, ctx: ProcedureContext) -> Result<(), ProcedureError>;

    /// Called synchronously right after the procedure was cancelled, before
    /// did-cancel observers. Composites forward cancellation from here.
    fn did_cancel(&self, _procedure: &Procedure, _errors: &[ProcedureError]) {}

    /// Should `execute` still run when the procedure was cancelled before it
    /// started?
    fn runs_when_cancelled(&self) -> bool {
        false
    }
}
