//! Procedure queue: admission, dependency bookkeeping and scheduling.
//!
//! Design intent:
//! - The queue owns every procedure it holds until that procedure finishes.
//! - Each procedure is driven by one tokio task (see `driver`), which waits
//!   on the gates in order: dependencies, conditions, suspension,
//!   exclusivity, concurrency slot, and suspension again before executing.
//! - Procedures only hold a `Weak` handle back to the queue.

mod config;
mod dependency;
mod driver;

pub use config::QueueConfig;
pub use dependency::DependencyGraph;

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::Instrument;

use crate::domain::{Outcome, ProcedureId, ProcedureState, QueueId};
use crate::error::ProcedureError;
use crate::exclusivity::ExclusivityManager;
use crate::observability::QueueCounts;
use crate::procedure::Procedure;

/// Callbacks about the procedures of one queue.
///
/// Each fires once per procedure, in the order `will_add`, `did_add`,
/// `will_finish`, `did_finish`. The queue is passed along so one delegate
/// can serve several queues.
pub trait QueueDelegate: Send + Sync {
    fn will_add(&self, _queue: &ProcedureQueue, _procedure: &Procedure) {}

    fn did_add(&self, _queue: &ProcedureQueue, _procedure: &Procedure) {}

    fn will_finish(
        &self,
        _queue: &ProcedureQueue,
        _procedure: &Procedure,
        _errors: &[ProcedureError],
    ) {
    }

    fn did_finish(
        &self,
        _queue: &ProcedureQueue,
        _procedure: &Procedure,
        _errors: &[ProcedureError],
    ) {
    }
}

#[derive(Default)]
struct QueueState {
    /// Held procedures in the order they were added.
    procedures: Vec<Procedure>,
    graph: DependencyGraph,
}

/// Concurrency bookkeeping: the limit and how many procedures of the queue
/// hold a slot.
#[derive(Debug, Clone, Copy, Default)]
struct Slots {
    max: Option<usize>,
    running: usize,
}

impl Slots {
    fn has_room(&self) -> bool {
        self.max.is_none_or(|max| self.running < max)
    }
}

/// A taken concurrency slot, given back on drop.
pub(crate) struct Slot {
    queue: Arc<QueueInner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.queue.slots_tx.send_modify(|slots| {
            slots.running = slots.running.saturating_sub(1);
        });
    }
}

pub(crate) struct QueueInner {
    id: QueueId,
    name: Option<String>,
    state: Mutex<QueueState>,
    suspended_tx: watch::Sender<bool>,
    slots_tx: watch::Sender<Slots>,
    len_tx: watch::Sender<usize>,
    delegate: Mutex<Option<Arc<dyn QueueDelegate>>>,
    exclusivity: Mutex<Arc<ExclusivityManager>>,
}

/// Schedules procedures. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct ProcedureQueue {
    inner: Arc<QueueInner>,
}

impl Default for ProcedureQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcedureQueue {
    /// Unbounded, running queue using the shared exclusivity manager.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        let (suspended_tx, _) = watch::channel(config.suspended);
        let (slots_tx, _) = watch::channel(Slots {
            max: config.concurrency_limit(),
            running: 0,
        });
        let (len_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(QueueInner {
                id: QueueId::generate(),
                name: config.name,
                state: Mutex::new(QueueState::default()),
                suspended_tx,
                slots_tx,
                len_tx,
                delegate: Mutex::new(None),
                exclusivity: Mutex::new(ExclusivityManager::shared()),
            }),
        }
    }

    pub fn with_delegate(self, delegate: Arc<dyn QueueDelegate>) -> Self {
        self.set_delegate(Some(delegate));
        self
    }

    /// Use `manager` instead of the process-wide exclusivity manager.
    pub fn with_exclusivity(self, manager: Arc<ExclusivityManager>) -> Self {
        *self
            .inner
            .exclusivity
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = manager;
        self
    }

    pub(crate) fn from_inner(inner: Arc<QueueInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> QueueId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn QueueDelegate>>) {
        *self.inner.delegate.lock().unwrap_or_else(|e| e.into_inner()) = delegate;
    }

    fn delegate(&self) -> Option<Arc<dyn QueueDelegate>> {
        self.inner
            .delegate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn exclusivity(&self) -> Arc<ExclusivityManager> {
        Arc::clone(
            &self
                .inner
                .exclusivity
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        )
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `procedure` and start driving it.
    ///
    /// Fails with `NoRuntime` outside a tokio runtime, `AlreadyEnqueued` if
    /// the procedure was added anywhere before, and `DependencyCycle` if its
    /// dependencies would form a cycle with procedures of this queue.
    pub fn add(&self, procedure: Procedure) -> Result<ProcedureFuture, ProcedureError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            tracing::error!(procedure = %procedure.id(), "procedure added outside a tokio runtime");
            ProcedureError::NoRuntime
        })?;

        let id = procedure.id();
        procedure.with_record(|record| {
            record
                .transition(id, ProcedureState::WillEnqueue)
                .map_err(|_| ProcedureError::AlreadyEnqueued { procedure: id })
        })?;

        if let Err(err) = self.link_dependencies(&procedure) {
            procedure.with_record(|record| record.state = ProcedureState::Initialized);
            tracing::error!(procedure = %id, error = %err, "rejected procedure");
            return Err(err);
        }

        procedure.with_record(|record| record.queue = Some(Arc::downgrade(&self.inner)));
        let delegate = self.delegate();
        if let Some(delegate) = &delegate {
            delegate.will_add(self, &procedure);
        }
        let len = {
            let mut state = self.state();
            state.procedures.push(procedure.clone());
            state.procedures.len()
        };
        self.inner.len_tx.send_replace(len);
        procedure.transition(ProcedureState::Pending)?;
        if let Some(delegate) = &delegate {
            delegate.did_add(self, &procedure);
        }

        tracing::debug!(
            queue = %self.id(),
            procedure = %id,
            name = %procedure.name(),
            "procedure added"
        );
        let span = tracing::debug_span!("procedure", id = %id, name = %procedure.name());
        runtime.spawn(driver::drive(self.clone(), procedure.clone()).instrument(span));

        Ok(ProcedureFuture { procedure })
    }

    /// Add several procedures, stopping at the first rejection.
    pub fn add_all(
        &self,
        procedures: impl IntoIterator<Item = Procedure>,
    ) -> Result<Vec<ProcedureFuture>, ProcedureError> {
        procedures.into_iter().map(|p| self.add(p)).collect()
    }

    /// Record the dependency edges of `procedure`, rejecting cycles.
    fn link_dependencies(&self, procedure: &Procedure) -> Result<(), ProcedureError> {
        let id = procedure.id();
        let dependencies = procedure.dependencies();
        let mut state = self.state();
        for dependency in &dependencies {
            state.graph.add_dependency(id, dependency.id());
        }
        if let Some(cycle) = state.graph.cycle_from(id) {
            for dependency in &dependencies {
                state.graph.remove_dependency(id, dependency.id());
            }
            return Err(ProcedureError::DependencyCycle { cycle });
        }
        Ok(())
    }

    /// Cancel every procedure currently held. They leave the queue as they
    /// finish.
    pub fn cancel_all(&self) {
        let procedures = self.procedures();
        tracing::debug!(queue = %self.id(), count = procedures.len(), "cancelling all procedures");
        for procedure in procedures {
            procedure.cancel();
        }
    }

    /// Suspended queues start no new work; executing procedures continue.
    pub fn set_suspended(&self, suspended: bool) {
        let changed = self.inner.suspended_tx.send_if_modified(|current| {
            let changed = *current != suspended;
            *current = suspended;
            changed
        });
        if changed {
            tracing::debug!(queue = %self.id(), suspended, "queue suspension changed");
        }
    }

    pub fn is_suspended(&self) -> bool {
        *self.inner.suspended_tx.borrow()
    }

    /// Change the concurrency limit.
    ///
    /// Executing procedures are never interrupted: after lowering the limit,
    /// no new procedure starts until fewer than the new limit are executing.
    pub fn set_max_concurrent(&self, max_concurrent: Option<usize>) {
        self.inner.slots_tx.send_modify(|slots| {
            slots.max = max_concurrent.map(|n| n.max(1));
        });
        tracing::debug!(queue = %self.id(), ?max_concurrent, "concurrency limit changed");
    }

    pub fn max_concurrent(&self) -> Option<usize> {
        self.inner.slots_tx.borrow().max
    }

    pub fn len(&self) -> usize {
        self.state().procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Held procedures in the order they were added.
    pub fn procedures(&self) -> Vec<Procedure> {
        self.state().procedures.clone()
    }

    pub fn contains(&self, id: ProcedureId) -> bool {
        self.state().procedures.iter().any(|p| p.id() == id)
    }

    pub fn counts(&self) -> QueueCounts {
        self.procedures().iter().map(Procedure::status).collect()
    }

    /// Resolve once the queue holds no procedures.
    pub async fn wait_until_empty(&self) {
        let mut len = self.inner.len_tx.subscribe();
        // the sender lives in `self.inner`, which `self` keeps alive
        let _ = len.wait_for(|n| *n == 0).await;
    }

    // ========================================
    // Driver plumbing
    // ========================================

    pub(crate) async fn wait_until_resumed(&self) {
        let mut suspended = self.inner.suspended_tx.subscribe();
        let _ = suspended.wait_for(|s| !*s).await;
    }

    /// Take a concurrency slot, following limit changes while waiting.
    pub(crate) async fn acquire_slot(&self) -> Slot {
        let mut slots = self.inner.slots_tx.subscribe();
        loop {
            let taken = self.inner.slots_tx.send_if_modified(|slots| {
                if !slots.has_room() {
                    return false;
                }
                slots.running += 1;
                true
            });
            if taken {
                return Slot {
                    queue: Arc::clone(&self.inner),
                };
            }
            // the sender lives in `self.inner`, which `self` keeps alive
            let _ = slots.wait_for(Slots::has_room).await;
        }
    }

    pub(crate) fn procedure_will_finish(&self, procedure: &Procedure, errors: &[ProcedureError]) {
        if !self.contains(procedure.id()) {
            return;
        }
        if let Some(delegate) = self.delegate() {
            delegate.will_finish(self, procedure, errors);
        }
    }

    pub(crate) fn procedure_did_finish(&self, procedure: &Procedure, errors: &[ProcedureError]) {
        let id = procedure.id();
        let len = {
            let mut state = self.state();
            let before = state.procedures.len();
            state.procedures.retain(|p| p.id() != id);
            if state.procedures.len() == before {
                return;
            }
            state.graph.remove_procedure(id);
            state.procedures.len()
        };
        if let Some(delegate) = self.delegate() {
            delegate.did_finish(self, procedure, errors);
        }
        self.inner.len_tx.send_replace(len);
    }
}

impl fmt::Debug for ProcedureQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureQueue")
            .field("id", &self.id())
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

/// Handle to an enqueued procedure; awaiting it yields the outcome.
#[derive(Debug, Clone)]
pub struct ProcedureFuture {
    procedure: Procedure,
}

impl ProcedureFuture {
    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }

    pub async fn wait(&self) -> Outcome {
        self.procedure.wait().await
    }
}

impl IntoFuture for ProcedureFuture {
    type Output = Outcome;
    type IntoFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.procedure.wait().await })
    }
}
