//! The task driving one enqueued procedure from pending to finished.

use super::ProcedureQueue;
use crate::condition::{ConditionResult, evaluate_conditions};
use crate::domain::ProcedureState;
use crate::error::ProcedureError;
use crate::procedure::{Procedure, ProcedureContext};

/// Drive `procedure` through its lifecycle on `queue`.
///
/// Gates, in order: dependencies, conditions, produced dependencies, queue
/// suspension, exclusivity locks, concurrency slot (with suspension checked
/// again once the slot is taken). A cancelled procedure
/// still waits for its dependencies, then finishes without executing unless
/// its work runs when cancelled.
pub(crate) async fn drive(queue: ProcedureQueue, procedure: Procedure) {
    let work = procedure.work();
    let runs_when_cancelled = work.runs_when_cancelled();

    for dependency in procedure.dependencies() {
        dependency.wait().await;
    }

    if !procedure.is_cancelled() && !procedure.conditions().is_empty() {
        if let Err(err) = procedure.transition(ProcedureState::EvaluatingConditions) {
            return abort(&procedure, err);
        }
        match evaluate_conditions(&procedure, &queue).await {
            ConditionResult::Satisfied => {}
            ConditionResult::Ignored => {
                tracing::debug!(procedure = %procedure.id(), "conditions ignored");
                procedure.cancel();
            }
            ConditionResult::Failed(err) => {
                tracing::debug!(procedure = %procedure.id(), error = %err, "conditions failed");
                procedure.cancel_with_errors(err.flatten());
            }
        }
    }

    for produced in procedure.produced_dependencies() {
        produced.wait().await;
    }

    if procedure.is_cancelled() && !runs_when_cancelled {
        return complete(&procedure, Vec::new());
    }
    if let Err(err) = procedure.transition(ProcedureState::Ready) {
        return abort(&procedure, err);
    }

    if !wait_while_suspended(&queue, &procedure, runs_when_cancelled).await {
        return complete(&procedure, Vec::new());
    }

    let categories = procedure.mutually_exclusive_categories();
    if !categories.is_empty() {
        let manager = queue.exclusivity();
        let request = manager.request_lock(procedure.id(), &categories);
        tokio::select! {
            _ = request.granted() => {
                procedure.hold_locks(manager, categories);
            }
            _ = procedure.cancelled(), if !runs_when_cancelled => {
                manager.unlock(procedure.id(), &categories);
                return complete(&procedure, Vec::new());
            }
        }
    }

    // The queue may be suspended again while the locks or the slot were
    // awaited; a slot taken on a suspended queue is handed back.
    let slot = loop {
        if !wait_while_suspended(&queue, &procedure, runs_when_cancelled).await {
            return complete(&procedure, Vec::new());
        }
        let slot = tokio::select! {
            slot = queue.acquire_slot() => slot,
            _ = procedure.cancelled(), if !runs_when_cancelled => {
                return complete(&procedure, Vec::new());
            }
        };
        if !queue.is_suspended() {
            break slot;
        }
        drop(slot);
    };

    if procedure.is_cancelled() && !runs_when_cancelled {
        return complete(&procedure, Vec::new());
    }
    if let Err(err) = procedure.transition(ProcedureState::Executing) {
        return abort(&procedure, err);
    }

    let observers = procedure.observers();
    for observer in &observers {
        observer.will_execute(&procedure);
    }
    tracing::debug!(procedure = %procedure.id(), "executing");
    let result = work.execute(ProcedureContext::new(procedure.clone())).await;
    for observer in &procedure.observers() {
        observer.did_execute(&procedure);
    }

    // Produced procedures may need the slot on this queue. The work may
    // already have finished its procedure explicitly.
    let id = procedure.id();
    procedure.with_record(|record| {
        if record.state == ProcedureState::Executing {
            let _ = record.transition(id, ProcedureState::WaitingForProduced);
        }
    });
    drop(slot);

    loop {
        let outstanding: Vec<Procedure> = procedure
            .produced()
            .into_iter()
            .filter(|p| !p.is_finished())
            .collect();
        if outstanding.is_empty() {
            break;
        }
        for produced in outstanding {
            produced.wait().await;
        }
    }

    let errors = match result {
        Ok(()) => Vec::new(),
        Err(err) => vec![err],
    };
    complete(&procedure, errors);
}

/// Wait for `queue` to be resumed. Returns `false` when the procedure was
/// cancelled meanwhile and should finish without executing.
async fn wait_while_suspended(queue: &ProcedureQueue, procedure: &Procedure, runs_when_cancelled: bool) -> bool {
    if !queue.is_suspended() {
        return true;
    }
    tracing::trace!(procedure = %procedure.id(), "waiting for queue to resume");
    tokio::select! {
        _ = queue.wait_until_resumed() => true,
        _ = procedure.cancelled(), if !runs_when_cancelled => false,
    }
}

fn complete(procedure: &Procedure, errors: Vec<ProcedureError>) {
    if let Err(err) = procedure.complete(errors) {
        tracing::error!(procedure = %procedure.id(), error = %err, "failed to finish procedure");
    }
}

/// An illegal transition left the procedure unable to proceed: cancel it
/// with the error and finish.
fn abort(procedure: &Procedure, err: ProcedureError) {
    procedure.cancel_with_error(err);
    complete(procedure, Vec::new());
}
