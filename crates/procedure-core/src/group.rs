//! Group procedures: a procedure made of child procedures.
//!
//! Design:
//! - A group owns a private `ProcedureQueue`, suspended until the group
//!   executes, and acts as that queue's delegate.
//! - The group finishes once every child (initial, added later, or produced
//!   by a child) finished. The last check and the finishing flag are set
//!   under one lock, so no child slips in afterwards.
//! - Child errors are collected as each child finishes, after an optional
//!   transform hook.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use async_trait::async_trait;

use crate::domain::ProcedureId;
use crate::error::ProcedureError;
use crate::procedure::{Procedure, ProcedureContext, WeakProcedure, Work};
use crate::queue::{ProcedureQueue, QueueConfig, QueueDelegate};

/// Rewrites (or clears) the errors a child contributes to its group.
pub type TransformChildErrors = Arc<dyn Fn(&Procedure, &mut Vec<ProcedureError>) + Send + Sync>;

#[derive(Default)]
struct GroupState {
    /// Every child, in the order the group learned about it.
    children: Vec<Procedure>,
    /// Children waiting for the group to start.
    initial: Vec<Procedure>,
    /// Produced children announced by `will_add` awaiting `did_add`.
    announcing: HashSet<ProcedureId>,
    started: bool,
    finishing: bool,
    suspended: bool,
}

struct GroupInner {
    queue: ProcedureQueue,
    state: Mutex<GroupState>,
    transform: Mutex<Option<TransformChildErrors>>,
    procedure: OnceLock<WeakProcedure>,
}

impl GroupInner {
    fn state(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn group(&self) -> Option<Procedure> {
        self.procedure.get().and_then(WeakProcedure::upgrade)
    }

    /// Add `child` to the private queue, bracketed by the group's
    /// will-add/did-add observers.
    fn enqueue(&self, group: &Procedure, child: Procedure) -> Result<(), ProcedureError> {
        let observers = group.observers();
        for observer in &observers {
            observer.will_add(group, &child);
        }
        self.queue.add(child.clone())?;
        for observer in &observers {
            observer.did_add(group, &child);
        }
        Ok(())
    }

    fn add_child(&self, group: &Procedure, child: Procedure) -> Result<(), ProcedureError> {
        let started = {
            let mut state = self.state();
            if state.finishing {
                tracing::error!(group = %group.id(), child = %child.id(), "child added to a finishing group");
                return Err(ProcedureError::GroupFinishing { group: group.id() });
            }
            if state.children.iter().any(|c| c.id() == child.id()) {
                return Ok(());
            }
            state.children.push(child.clone());
            if !state.started {
                state.initial.push(child.clone());
            }
            state.started
        };

        if group.is_cancelled() {
            forward_cancellation(&child, &group.errors());
        }
        if started {
            self.enqueue(group, child)?;
        }
        Ok(())
    }

    fn collect_child_errors(&self, child: &Procedure, errors: &[ProcedureError]) {
        let Some(group) = self.group() else {
            return;
        };
        if group.is_cancelled() {
            return;
        }
        let transform = self
            .transform
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut errors = errors.to_vec();
        if let Some(transform) = transform {
            transform(child, &mut errors);
            tracing::trace!(group = %group.id(), child = %child.id(), "child errors transformed");
        }
        if !errors.is_empty() {
            tracing::debug!(group = %group.id(), child = %child.id(), errors = errors.len(), "child finished with errors");
        }
        group.append_errors(errors);
    }
}

/// Cancel `child` of a cancelled group, citing the group's first error.
fn forward_cancellation(child: &Procedure, errors: &[ProcedureError]) {
    match errors.first() {
        Some(cause) => child.cancel_with_error(ProcedureError::ParentCancelled {
            cause: Box::new(cause.clone()),
        }),
        None => child.cancel(),
    }
}

/// Delegate of the private queue. Holds the group weakly.
struct GroupQueueDelegate {
    group: Weak<GroupInner>,
}

impl QueueDelegate for GroupQueueDelegate {
    fn will_add(&self, queue: &ProcedureQueue, child: &Procedure) {
        let Some(inner) = self.group.upgrade() else {
            return;
        };
        if queue.id() != inner.queue.id() {
            return;
        }
        let produced = {
            let mut state = inner.state();
            if state.children.iter().any(|c| c.id() == child.id()) {
                false
            } else {
                if state.finishing {
                    tracing::warn!(child = %child.id(), "child produced while the group is finishing");
                }
                state.children.push(child.clone());
                state.announcing.insert(child.id());
                true
            }
        };
        if produced && let Some(group) = inner.group() {
            if group.is_cancelled() {
                forward_cancellation(child, &group.errors());
            }
            for observer in &group.observers() {
                observer.will_add(&group, child);
            }
        }
    }

    fn did_add(&self, queue: &ProcedureQueue, child: &Procedure) {
        let Some(inner) = self.group.upgrade() else {
            return;
        };
        if queue.id() != inner.queue.id() {
            return;
        }
        let produced = inner.state().announcing.remove(&child.id());
        if produced && let Some(group) = inner.group() {
            for observer in &group.observers() {
                observer.did_add(&group, child);
            }
        }
    }

    fn will_finish(&self, queue: &ProcedureQueue, child: &Procedure, errors: &[ProcedureError]) {
        if let Some(inner) = self.group.upgrade()
            && queue.id() == inner.queue.id()
        {
            inner.collect_child_errors(child, errors);
        }
    }
}

/// The group's `Work`.
struct GroupWork {
    inner: Arc<GroupInner>,
}

#[async_trait]
impl Work for GroupWork {
    async fn execute(&self, ctx: ProcedureContext) -> Result<(), ProcedureError> {
        let group = ctx.procedure();
        let (initial, suspended) = {
            let mut state = self.inner.state();
            state.started = true;
            (std::mem::take(&mut state.initial), state.suspended)
        };
        for child in initial {
            if let Err(err) = self.inner.enqueue(group, child.clone()) {
                tracing::error!(group = %group.id(), child = %child.id(), error = %err, "could not enqueue child");
                group.append_errors(vec![err]);
                self.inner.state().children.retain(|c| c.id() != child.id());
            }
        }
        if !suspended {
            self.inner.queue.set_suspended(false);
        }

        loop {
            let pending: Vec<Procedure> = {
                let mut state = self.inner.state();
                let pending: Vec<Procedure> = state
                    .children
                    .iter()
                    .filter(|c| !c.is_finished())
                    .cloned()
                    .collect();
                if pending.is_empty() {
                    state.finishing = true;
                    break;
                }
                pending
            };
            for child in pending {
                child.wait().await;
            }
        }
        tracing::debug!(group = %group.id(), "all children finished");
        Ok(())
    }

    fn did_cancel(&self, group: &Procedure, errors: &[ProcedureError]) {
        let children = self.inner.state().children.clone();
        tracing::debug!(group = %group.id(), children = children.len(), "forwarding cancellation to children");
        for child in &children {
            forward_cancellation(child, errors);
        }
    }

    fn runs_when_cancelled(&self) -> bool {
        true
    }
}

/// A procedure that runs child procedures on a private queue.
///
/// # Example
/// ```ignore
/// let group = GroupProcedure::new("sync", vec![fetch, parse, store]);
/// queue.add(group.procedure().clone())?.await;
/// ```
#[derive(Clone)]
pub struct GroupProcedure {
    procedure: Procedure,
    inner: Arc<GroupInner>,
}

impl GroupProcedure {
    pub fn new(name: impl Into<String>, children: impl IntoIterator<Item = Procedure>) -> Self {
        let name = name.into();
        let queue = ProcedureQueue::with_config(QueueConfig {
            name: Some(format!("{name}.queue")),
            max_concurrent: None,
            suspended: true,
        });
        let inner = Arc::new(GroupInner {
            queue,
            state: Mutex::new(GroupState::default()),
            transform: Mutex::new(None),
            procedure: OnceLock::new(),
        });
        inner.queue.set_delegate(Some(Arc::new(GroupQueueDelegate {
            group: Arc::downgrade(&inner),
        })));

        let procedure = Procedure::new(
            name,
            GroupWork {
                inner: Arc::clone(&inner),
            },
        );
        let _ = inner.procedure.set(procedure.downgrade());

        {
            let mut state = inner.state();
            for child in children {
                if !state.children.iter().any(|c| c.id() == child.id()) {
                    state.children.push(child.clone());
                    state.initial.push(child);
                }
            }
        }

        Self { procedure, inner }
    }

    /// The procedure to add to a queue.
    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }

    pub fn children(&self) -> Vec<Procedure> {
        self.inner.state().children.clone()
    }

    /// Add a child. Rejected with `GroupFinishing` once the group started to
    /// finish; a child added to a cancelled group is cancelled.
    pub fn add_child(&self, child: Procedure) -> Result<(), ProcedureError> {
        self.inner.add_child(&self.procedure, child)
    }

    pub fn add_children(
        &self,
        children: impl IntoIterator<Item = Procedure>,
    ) -> Result<(), ProcedureError> {
        for child in children {
            self.add_child(child)?;
        }
        Ok(())
    }

    /// Pause or resume the private queue. Executing children are unaffected.
    pub fn set_suspended(&self, suspended: bool) {
        let started = {
            let mut state = self.inner.state();
            state.suspended = suspended;
            state.started
        };
        if started || suspended {
            self.inner.queue.set_suspended(suspended);
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.state().suspended
    }

    pub fn set_max_concurrent(&self, max_concurrent: Option<usize>) {
        self.inner.queue.set_max_concurrent(max_concurrent);
    }

    /// Install the hook rewriting each child's errors before aggregation.
    /// Called exactly once per finishing child, unless the group was
    /// cancelled.
    pub fn set_transform_child_errors(
        &self,
        transform: impl Fn(&Procedure, &mut Vec<ProcedureError>) + Send + Sync + 'static,
    ) {
        *self
            .inner
            .transform
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(transform));
    }

    pub fn is_finishing(&self) -> bool {
        self.inner.state().finishing
    }
}

impl fmt::Debug for GroupProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupProcedure")
            .field("procedure", &self.procedure)
            .field("children", &self.inner.state().children.len())
            .finish()
    }
}
