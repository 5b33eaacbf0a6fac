//! Lifecycle observers.

use std::time::Duration;

use super::Procedure;
use crate::error::ProcedureError;

/// Lifecycle callbacks. All methods default to no-ops.
///
/// Observers of one procedure fire in attachment order, synchronously at the
/// transition they describe. They run outside the procedure's lock, so they
/// may call back into the procedure (e.g. cancel it).
pub trait ProcedureObserver: Send + Sync {
    fn did_attach(&self, _procedure: &Procedure) {}

    fn will_execute(&self, _procedure: &Procedure) {}

    fn did_execute(&self, _procedure: &Procedure) {}

    fn will_cancel(&self, _procedure: &Procedure, _errors: &[ProcedureError]) {}

    fn did_cancel(&self, _procedure: &Procedure, _errors: &[ProcedureError]) {}

    /// `procedure` is about to add `child` (produce, group child).
    fn will_add(&self, _procedure: &Procedure, _child: &Procedure) {}

    fn did_add(&self, _procedure: &Procedure, _child: &Procedure) {}

    fn will_finish(&self, _procedure: &Procedure, _errors: &[ProcedureError]) {}

    fn did_finish(&self, _procedure: &Procedure, _errors: &[ProcedureError]) {}
}

type ProcedureHook = Box<dyn Fn(&Procedure) + Send + Sync>;
type ErrorsHook = Box<dyn Fn(&Procedure, &[ProcedureError]) + Send + Sync>;
type ChildHook = Box<dyn Fn(&Procedure, &Procedure) + Send + Sync>;

/// Observer assembled from closures.
///
/// # Example
/// ```ignore
/// procedure.add_observer(
///     BlockObserver::new()
///         .on_will_execute(|p| tracing::info!(name = %p.name(), "starting"))
///         .on_did_finish(|p, errors| tracing::info!(errors = errors.len(), "done")),
/// );
/// ```
#[derive(Default)]
pub struct BlockObserver {
    did_attach: Option<ProcedureHook>,
    will_execute: Option<ProcedureHook>,
    did_execute: Option<ProcedureHook>,
    will_cancel: Option<ErrorsHook>,
    did_cancel: Option<ErrorsHook>,
    will_add: Option<ChildHook>,
    did_add: Option<ChildHook>,
    will_finish: Option<ErrorsHook>,
    did_finish: Option<ErrorsHook>,
}

impl BlockObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_did_attach(mut self, f: impl Fn(&Procedure) + Send + Sync + 'static) -> Self {
        self.did_attach = Some(Box::new(f));
        self
    }

    pub fn on_will_execute(mut self, f: impl Fn(&Procedure) + Send + Sync + 'static) -> Self {
        self.will_execute = Some(Box::new(f));
        self
    }

    pub fn on_did_execute(mut self, f: impl Fn(&Procedure) + Send + Sync + 'static) -> Self {
        self.did_execute = Some(Box::new(f));
        self
    }

    pub fn on_will_cancel(
        mut self,
        f: impl Fn(&Procedure, &[ProcedureError]) + Send + Sync + 'static,
    ) -> Self {
        self.will_cancel = Some(Box::new(f));
        self
    }

    pub fn on_did_cancel(
        mut self,
        f: impl Fn(&Procedure, &[ProcedureError]) + Send + Sync + 'static,
    ) -> Self {
        self.did_cancel = Some(Box::new(f));
        self
    }

    pub fn on_will_add(mut self, f: impl Fn(&Procedure, &Procedure) + Send + Sync + 'static) -> Self {
        self.will_add = Some(Box::new(f));
        self
    }

    pub fn on_did_add(mut self, f: impl Fn(&Procedure, &Procedure) + Send + Sync + 'static) -> Self {
        self.did_add = Some(Box::new(f));
        self
    }

    pub fn on_will_finish(
        mut self,
        f: impl Fn(&Procedure, &[ProcedureError]) + Send + Sync + 'static,
    ) -> Self {
        self.will_finish = Some(Box::new(f));
        self
    }

    pub fn on_did_finish(
        mut self,
        f: impl Fn(&Procedure, &[ProcedureError]) + Send + Sync + 'static,
    ) -> Self {
        self.did_finish = Some(Box::new(f));
        self
    }
}

impl ProcedureObserver for BlockObserver {
    fn did_attach(&self, procedure: &Procedure) {
        if let Some(f) = &self.did_attach {
            f(procedure);
        }
    }

    fn will_execute(&self, procedure: &Procedure) {
        if let Some(f) = &self.will_execute {
            f(procedure);
        }
    }

    fn did_execute(&self, procedure: &Procedure) {
        if let Some(f) = &self.did_execute {
            f(procedure);
        }
    }

    fn will_cancel(&self, procedure: &Procedure, errors: &[ProcedureError]) {
        if let Some(f) = &self.will_cancel {
            f(procedure, errors);
        }
    }

    fn did_cancel(&self, procedure: &Procedure, errors: &[ProcedureError]) {
        if let Some(f) = &self.did_cancel {
            f(procedure, errors);
        }
    }

    fn will_add(&self, procedure: &Procedure, child: &Procedure) {
        if let Some(f) = &self.will_add {
            f(procedure, child);
        }
    }

    fn did_add(&self, procedure: &Procedure, child: &Procedure) {
        if let Some(f) = &self.did_add {
            f(procedure, child);
        }
    }

    fn will_finish(&self, procedure: &Procedure, errors: &[ProcedureError]) {
        if let Some(f) = &self.will_finish {
            f(procedure, errors);
        }
    }

    fn did_finish(&self, procedure: &Procedure, errors: &[ProcedureError]) {
        if let Some(f) = &self.did_finish {
            f(procedure, errors);
        }
    }
}

/// Cancels the procedure with `ProcedureError::Timeout` if it is still
/// running `after` its execution started.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutObserver {
    after: Duration,
}

impl TimeoutObserver {
    pub fn new(after: Duration) -> Self {
        Self { after }
    }
}

impl ProcedureObserver for TimeoutObserver {
    fn will_execute(&self, procedure: &Procedure) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(procedure = %procedure.id(), "timeout observer needs a tokio runtime; timeout not armed");
            return;
        };
        let after = self.after;
        let procedure = procedure.downgrade();
        handle.spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(procedure) = procedure.upgrade()
                && !procedure.is_finished()
            {
                tracing::debug!(procedure = %procedure.id(), ?after, "timed out");
                procedure.cancel_with_error(ProcedureError::Timeout { after });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use crate::queue::ProcedureQueue;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, BlockObserver) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let push = |events: &Arc<Mutex<Vec<String>>>, label: &'static str| {
            let events = Arc::clone(events);
            move || events.lock().unwrap().push(label.to_string())
        };
        let (a, b, c, d, e) = (
            push(&events, "did_attach"),
            push(&events, "will_execute"),
            push(&events, "did_execute"),
            push(&events, "will_finish"),
            push(&events, "did_finish"),
        );
        let observer = BlockObserver::new()
            .on_did_attach(move |_| a())
            .on_will_execute(move |_| b())
            .on_did_execute(move |_| c())
            .on_will_finish(move |_, _| d())
            .on_did_finish(move |_, _| e());
        (events, observer)
    }

    #[tokio::test]
    async fn lifecycle_events_fire_in_order() {
        let (events, observer) = recorder();
        let procedure = Procedure::block("observed", |_ctx| async { Ok(()) });
        procedure.add_observer(observer);

        ProcedureQueue::new().add(procedure).unwrap().await;

        assert_eq!(
            *events.lock().unwrap(),
            vec!["did_attach", "will_execute", "did_execute", "will_finish", "did_finish"]
        );
    }

    #[tokio::test]
    async fn observers_fire_in_attachment_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let procedure = Procedure::block("ordered", |_ctx| async { Ok(()) });
        for i in 0..3 {
            let order = Arc::clone(&order);
            procedure.add_observer(
                BlockObserver::new().on_did_finish(move |_, _| order.lock().unwrap().push(i)),
            );
        }

        ProcedureQueue::new().add(procedure).unwrap().await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn cancelled_procedure_skips_execute_events() {
        let (events, observer) = recorder();
        let procedure = Procedure::block("skipped", |_ctx| async { Ok(()) });
        procedure.add_observer(observer);
        procedure.cancel();

        let outcome = ProcedureQueue::new().add(procedure).unwrap().await;

        assert!(outcome.is_cancelled());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["did_attach", "will_finish", "did_finish"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_with_timeout_error() {
        let procedure = Procedure::block("slow", |ctx| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
                _ = ctx.cancelled() => {}
            }
            Ok(())
        });
        procedure.add_observer(TimeoutObserver::new(Duration::from_millis(50)));

        let outcome = ProcedureQueue::new().add(procedure.clone()).unwrap().await;

        assert!(procedure.is_cancelled());
        assert!(matches!(outcome.errors(), [ProcedureError::Timeout { .. }]));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_does_not_fire_after_finish() {
        let procedure = Procedure::block("fast", |_ctx| async { Ok(()) });
        procedure.add_observer(TimeoutObserver::new(Duration::from_millis(50)));

        let outcome = ProcedureQueue::new().add(procedure.clone()).unwrap().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(outcome.is_success());
        assert!(!procedure.is_cancelled());
    }
}
