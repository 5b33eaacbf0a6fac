//! Procedures: the unit of work and its lifecycle.
//!
//! A `Procedure` is a cheap cloneable handle. The queue that owns it drives
//! the lifecycle; everything else (cancel, finish, observers) is callable from
//! any thread or task.

mod builtin;
mod context;
mod observer;
mod output;
mod record;
mod work;

pub use builtin::{BlockProcedure, DelayProcedure};
pub use context::ProcedureContext;
pub use observer::{BlockObserver, ProcedureObserver, TimeoutObserver};
pub use output::Output;
pub use work::Work;

pub(crate) use record::ProcedureRecord;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;

use crate::condition::Condition;
use crate::domain::{Outcome, ProcedureId, ProcedureState, ProcedureStatus};
use crate::error::ProcedureError;
use crate::exclusivity::ExclusivityManager;
use crate::queue::ProcedureQueue;

/// A unit of work with a lifecycle, dependencies, conditions and observers.
#[derive(Clone)]
pub struct Procedure {
    inner: Arc<ProcedureInner>,
}

pub(crate) struct ProcedureInner {
    id: ProcedureId,
    record: Mutex<ProcedureRecord>,
    work: Arc<dyn Work>,
    cancel_tx: watch::Sender<bool>,
    finished_tx: watch::Sender<bool>,
}

/// Non-owning procedure handle.
#[derive(Clone)]
pub struct WeakProcedure {
    id: ProcedureId,
    inner: Weak<ProcedureInner>,
}

impl WeakProcedure {
    pub fn id(&self) -> ProcedureId {
        self.id
    }

    pub fn upgrade(&self) -> Option<Procedure> {
        self.inner.upgrade().map(|inner| Procedure { inner })
    }
}

impl Procedure {
    pub fn new(name: impl Into<String>, work: impl Work) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (finished_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ProcedureInner {
                id: ProcedureId::generate(),
                record: Mutex::new(ProcedureRecord::new(name.into())),
                work: Arc::new(work),
                cancel_tx,
                finished_tx,
            }),
        }
    }

    /// Procedure running an async closure.
    pub fn block<F, Fut>(name: impl Into<String>, block: F) -> Self
    where
        F: Fn(ProcedureContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProcedureError>> + Send + 'static,
    {
        Self::new(name, BlockProcedure::new(block))
    }

    pub fn id(&self) -> ProcedureId {
        self.inner.id
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Rename the procedure. Only allowed before it starts executing.
    pub fn set_name(&self, name: impl Into<String>) -> Result<(), ProcedureError> {
        let mut record = self.lock();
        if record.state >= ProcedureState::Executing {
            return Err(ProcedureError::InvalidTransition {
                procedure: self.id(),
                from: record.state,
                to: record.state,
            });
        }
        record.name = name.into();
        Ok(())
    }

    pub fn state(&self) -> ProcedureState {
        self.lock().state
    }

    pub fn is_enqueued(&self) -> bool {
        self.state().is_enqueued()
    }

    pub fn is_executing(&self) -> bool {
        self.state() == ProcedureState::Executing
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn errors(&self) -> Vec<ProcedureError> {
        self.lock().errors.clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.lock().errors.is_empty()
    }

    pub fn status(&self) -> ProcedureStatus {
        let record = self.lock();
        ProcedureStatus::from_parts(record.state, record.cancelled, !record.errors.is_empty())
    }

    /// Terminal outcome, once finished.
    pub fn outcome(&self) -> Option<Outcome> {
        let record = self.lock();
        if !record.state.is_terminal() {
            return None;
        }
        Some(Outcome::from_parts(record.cancelled, record.errors.clone()))
    }

    pub fn dependencies(&self) -> Vec<Procedure> {
        self.lock().dependencies.clone()
    }

    pub fn conditions(&self) -> Vec<Condition> {
        self.lock().conditions.clone()
    }

    /// Union of the exclusivity categories of all attached conditions.
    pub fn mutually_exclusive_categories(&self) -> BTreeSet<String> {
        self.lock().categories()
    }

    /// `self` will not become ready until `dependency` finished.
    pub fn add_dependency(&self, dependency: &Procedure) -> Result<(), ProcedureError> {
        if dependency.id() == self.id() {
            return Err(ProcedureError::DependencyCycle {
                cycle: vec![self.id(), self.id()],
            });
        }
        let mut record = self.lock();
        if !record.is_configurable() {
            return Err(ProcedureError::AlreadyEnqueued {
                procedure: self.id(),
            });
        }
        if !record.dependencies.iter().any(|d| d.id() == dependency.id()) {
            record.dependencies.push(dependency.clone());
        }
        Ok(())
    }

    pub fn add_dependencies<'a>(
        &self,
        dependencies: impl IntoIterator<Item = &'a Procedure>,
    ) -> Result<(), ProcedureError> {
        for dependency in dependencies {
            self.add_dependency(dependency)?;
        }
        Ok(())
    }

    pub fn add_condition(&self, condition: Condition) -> Result<(), ProcedureError> {
        let mut record = self.lock();
        if !record.is_configurable() {
            return Err(ProcedureError::AlreadyEnqueued {
                procedure: self.id(),
            });
        }
        record.conditions.push(condition);
        Ok(())
    }

    /// Shorthand for attaching `Condition::mutually_exclusive(category)`.
    pub fn add_mutually_exclusive_category(
        &self,
        category: impl Into<String>,
    ) -> Result<(), ProcedureError> {
        self.add_condition(Condition::mutually_exclusive(category))
    }

    /// Attach an observer. Observers fire in attachment order.
    pub fn add_observer(&self, observer: impl ProcedureObserver + 'static) {
        let observer: Arc<dyn ProcedureObserver> = Arc::new(observer);
        {
            let mut record = self.lock();
            if record.state.is_terminal() {
                tracing::warn!(procedure = %self.id(), "observer attached after finish is ignored");
                return;
            }
            record.observers.push(Arc::clone(&observer));
        }
        observer.did_attach(self);
    }

    pub fn cancel(&self) {
        self.cancel_with_errors(Vec::new());
    }

    pub fn cancel_with_error(&self, error: ProcedureError) {
        self.cancel_with_errors(vec![error]);
    }

    /// Cancel, setting the flag and the errors in one critical section.
    ///
    /// No-op if already cancelled or finishing.
    pub(crate) fn cancel_with_errors(&self, errors: Vec<ProcedureError>) {
        let (observers, snapshot) = {
            let mut record = self.lock();
            if !record.mark_cancelled(errors) {
                return;
            }
            (record.observers.clone(), record.errors.clone())
        };
        tracing::debug!(procedure = %self.id(), errors = snapshot.len(), "cancelled");

        for observer in &observers {
            observer.will_cancel(self, &snapshot);
        }
        self.inner.work.did_cancel(self, &snapshot);
        self.inner.cancel_tx.send_replace(true);
        for observer in &observers {
            observer.did_cancel(self, &snapshot);
        }
    }

    /// Finish without errors. Only the first finish has an effect.
    pub fn finish(&self) -> Result<(), ProcedureError> {
        self.finish_with_errors(Vec::new())
    }

    pub fn finish_with_error(&self, error: ProcedureError) -> Result<(), ProcedureError> {
        self.finish_with_errors(vec![error])
    }

    /// Finish with errors.
    ///
    /// Before the procedure executes this is only legal when it was
    /// cancelled; the errors are kept and the queue finishes it once its
    /// dependencies cleared. Finishing a procedure that is neither executing
    /// nor cancelled is a programming error.
    pub fn finish_with_errors(&self, errors: Vec<ProcedureError>) -> Result<(), ProcedureError> {
        self.finish_internal(errors, false)
    }

    /// Wait until finished and return the outcome.
    pub async fn wait(&self) -> Outcome {
        let mut finished = self.inner.finished_tx.subscribe();
        // the sender lives as long as `self`, so this only returns once finished
        let _ = finished.wait_for(|done| *done).await;
        let record = self.lock();
        Outcome::from_parts(record.cancelled, record.errors.clone())
    }

    /// Resolve once the procedure is cancelled.
    pub async fn cancelled(&self) {
        let mut cancelled = self.inner.cancel_tx.subscribe();
        let _ = cancelled.wait_for(|c| *c).await;
    }

    pub fn downgrade(&self) -> WeakProcedure {
        WeakProcedure {
            id: self.id(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ========================================
    // Crate-internal lifecycle plumbing
    // ========================================

    fn lock(&self) -> MutexGuard<'_, ProcedureRecord> {
        self.inner.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn with_record<R>(&self, f: impl FnOnce(&mut ProcedureRecord) -> R) -> R {
        f(&mut self.lock())
    }

    pub(crate) fn work(&self) -> Arc<dyn Work> {
        Arc::clone(&self.inner.work)
    }

    pub(crate) fn transition(&self, to: ProcedureState) -> Result<ProcedureState, ProcedureError> {
        let result = self.lock().transition(self.id(), to);
        match &result {
            Ok(from) => tracing::trace!(procedure = %self.id(), %from, %to, "transition"),
            Err(err) => tracing::error!(procedure = %self.id(), error = %err, "illegal transition"),
        }
        result
    }

    pub(crate) fn observers(&self) -> Vec<Arc<dyn ProcedureObserver>> {
        self.lock().observers.clone()
    }

    pub(crate) fn owning_queue(&self) -> Option<ProcedureQueue> {
        self.lock()
            .queue
            .as_ref()
            .and_then(Weak::upgrade)
            .map(ProcedureQueue::from_inner)
    }

    /// Append errors (group aggregation, retry). Dropped with a warning once
    /// the procedure finished.
    pub(crate) fn append_errors(&self, errors: Vec<ProcedureError>) {
        if errors.is_empty() {
            return;
        }
        if let Some(rejected) = self.lock().append_errors(errors) {
            for error in rejected {
                tracing::warn!(procedure = %self.id(), %error, "dropping error reported after finish");
            }
        }
    }

    pub(crate) fn add_produced_dependency(&self, dependency: &Procedure) {
        let mut record = self.lock();
        if !record
            .produced_dependencies
            .iter()
            .any(|d| d.id() == dependency.id())
        {
            record.produced_dependencies.push(dependency.clone());
        }
    }

    pub(crate) fn produced_dependencies(&self) -> Vec<Procedure> {
        self.lock().produced_dependencies.clone()
    }

    pub(crate) fn record_produced(&self, produced: &Procedure) {
        self.lock().produced.push(produced.downgrade());
    }

    pub(crate) fn produced(&self) -> Vec<Procedure> {
        self.lock()
            .produced
            .iter()
            .filter_map(WeakProcedure::upgrade)
            .collect()
    }

    pub(crate) fn hold_locks(&self, manager: Arc<ExclusivityManager>, categories: BTreeSet<String>) {
        self.lock().held_locks = Some((manager, categories));
    }

    /// Finish driven by the queue: also legal for a cancelled procedure that
    /// never executed.
    pub(crate) fn complete(&self, errors: Vec<ProcedureError>) -> Result<(), ProcedureError> {
        self.finish_internal(errors, true)
    }

    fn finish_internal(
        &self,
        errors: Vec<ProcedureError>,
        from_queue: bool,
    ) -> Result<(), ProcedureError> {
        let (observers, queue, snapshot) = {
            let mut record = self.lock();
            match record.state {
                ProcedureState::Finishing | ProcedureState::Finished => {
                    tracing::trace!(procedure = %self.id(), "finish already handled");
                    for error in errors {
                        tracing::warn!(procedure = %self.id(), %error, "dropping error passed to a repeated finish");
                    }
                    return Ok(());
                }
                ProcedureState::Executing | ProcedureState::WaitingForProduced => {}
                _ if record.cancelled && from_queue => {}
                _ if record.cancelled => {
                    // finish before start: the queue completes it once the
                    // dependencies cleared
                    record.errors.extend(errors);
                    return Ok(());
                }
                state => {
                    let err = ProcedureError::InvalidTransition {
                        procedure: self.id(),
                        from: state,
                        to: ProcedureState::Finishing,
                    };
                    tracing::error!(procedure = %self.id(), error = %err, "finish called before execution");
                    return Err(err);
                }
            }
            record.transition(self.id(), ProcedureState::Finishing)?;
            record.errors.extend(errors);
            (
                record.observers.clone(),
                record.queue.as_ref().and_then(Weak::upgrade),
                record.errors.clone(),
            )
        };
        let queue = queue.map(ProcedureQueue::from_inner);

        for observer in &observers {
            observer.will_finish(self, &snapshot);
        }
        if let Some(queue) = &queue {
            queue.procedure_will_finish(self, &snapshot);
        }

        let (snapshot, cancelled, held, elapsed) = {
            let mut record = self.lock();
            record.transition(self.id(), ProcedureState::Finished)?;
            (
                record.errors.clone(),
                record.cancelled,
                record.held_locks.take(),
                record.created_at.elapsed(),
            )
        };
        if let Some((manager, categories)) = held {
            manager.unlock(self.id(), &categories);
        }
        tracing::debug!(
            procedure = %self.id(),
            errors = snapshot.len(),
            cancelled,
            elapsed_ms = elapsed.as_millis() as u64,
            "finished"
        );

        for observer in &observers {
            observer.did_finish(self, &snapshot);
        }
        if let Some(queue) = &queue {
            queue.procedure_did_finish(self, &snapshot);
        }
        self.inner.finished_tx.send_replace(true);
        Ok(())
    }
}

impl PartialEq for Procedure {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Procedure {}

impl Hash for Procedure {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.lock();
        f.debug_struct("Procedure")
            .field("id", &self.id())
            .field("name", &record.name)
            .field("state", &record.state)
            .field("cancelled", &record.cancelled)
            .field("errors", &record.errors.len())
            .finish()
    }
}
