//! Execution context handed to `Work::execute`.

use super::Procedure;
use crate::domain::ProcedureId;
use crate::error::ProcedureError;
use crate::queue::ProcedureFuture;

/// Capability token for the running procedure.
///
/// Gives the work access to its own procedure and lets it produce new
/// procedures onto the owning queue without holding a reference to the queue.
#[derive(Clone)]
pub struct ProcedureContext {
    procedure: Procedure,
}

impl ProcedureContext {
    pub(crate) fn new(procedure: Procedure) -> Self {
        Self { procedure }
    }

    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }

    pub fn id(&self) -> ProcedureId {
        self.procedure.id()
    }

    pub fn is_cancelled(&self) -> bool {
        self.procedure.is_cancelled()
    }

    /// Resolve once the procedure is cancelled. Meant for `tokio::select!`.
    pub async fn cancelled(&self) {
        self.procedure.cancelled().await
    }

    /// Add `procedure` to the queue running this one.
    ///
    /// The producing procedure does not finish before the produced one did.
    /// Will-add/did-add observers of the producer bracket the queue insertion.
    pub fn produce(&self, procedure: Procedure) -> Result<ProcedureFuture, ProcedureError> {
        let queue = self
            .procedure
            .owning_queue()
            .ok_or(ProcedureError::NotEnqueued {
                procedure: self.procedure.id(),
            })?;

        let observers = self.procedure.observers();
        for observer in &observers {
            observer.will_add(&self.procedure, &procedure);
        }
        let future = queue.add(procedure.clone())?;
        self.procedure.record_produced(&procedure);
        tracing::debug!(
            procedure = %self.procedure.id(),
            produced = %procedure.id(),
            "produced procedure"
        );
        for observer in &observers {
            observer.did_add(&self.procedure, &procedure);
        }
        Ok(future)
    }
}
