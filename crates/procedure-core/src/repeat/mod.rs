//! Repeating procedures: run a stream of payloads one after another.
//!
//! Design:
//! - Every attempt runs on a private `ProcedureQueue`; so does the delay
//!   before it, as a `DelayProcedure`, which makes delays cancellable.
//! - `RepeatProcedure` keeps going until the payloads run out or `max`
//!   attempts were made. `RetryProcedure` (see `retry`) stops at the first
//!   attempt without errors.
//! - Cancelling the repeating procedure cancels the running attempt or delay.

mod retry;
mod wait;

pub use retry::{DefaultRetryDecider, RetryDecider, RetryFailureInfo, RetryProcedure};
pub use wait::WaitStrategy;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProcedureError;
use crate::procedure::{DelayProcedure, Procedure, ProcedureContext, Work};
use crate::queue::{ProcedureQueue, QueueConfig};

/// Hook run on an attempt right before it is enqueued.
pub type ConfigureAttempt = Arc<dyn Fn(&Procedure) + Send + Sync>;

/// Source of attempts.
pub type Payloads = Box<dyn Iterator<Item = RepeatPayload> + Send>;

/// One attempt: the procedure, the delay before it, and an optional
/// configuration hook.
#[derive(Clone)]
pub struct RepeatPayload {
    pub procedure: Procedure,
    pub delay: Option<Duration>,
    pub configure: Option<ConfigureAttempt>,
}

impl RepeatPayload {
    pub fn new(procedure: Procedure) -> Self {
        Self {
            procedure,
            delay: None,
            configure: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_configure(mut self, configure: impl Fn(&Procedure) + Send + Sync + 'static) -> Self {
        self.configure = Some(Arc::new(configure));
        self
    }
}

impl fmt::Debug for RepeatPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatPayload")
            .field("procedure", &self.procedure)
            .field("delay", &self.delay)
            .field("configure", &self.configure.is_some())
            .finish()
    }
}

/// Payloads built by `factory`, spaced by `wait`.
///
/// The first payload has no delay; the `n`-th one after it waits
/// `wait.delay(n - 1)`.
pub fn payloads_from_fn<F>(
    wait: WaitStrategy,
    mut factory: F,
) -> impl Iterator<Item = RepeatPayload> + Send + 'static
where
    F: FnMut() -> Procedure + Send + 'static,
{
    (0u32..).map(move |n| {
        let payload = RepeatPayload::new(factory());
        if n == 0 {
            payload
        } else {
            payload.with_delay(wait.delay(n - 1))
        }
    })
}

#[derive(Default)]
struct AttemptState {
    count: usize,
    max: Option<usize>,
    current: Option<Procedure>,
    last: Option<Procedure>,
    delay: Option<Procedure>,
    attempt_errors: Vec<ProcedureError>,
    lifetime_errors: Vec<ProcedureError>,
}

/// Runs attempts on the private queue and keeps their history.
struct Attempts {
    queue: ProcedureQueue,
    payloads: Mutex<Payloads>,
    state: Mutex<AttemptState>,
}

impl Attempts {
    fn new(name: &str, payloads: Payloads) -> Self {
        Self {
            queue: ProcedureQueue::with_config(QueueConfig::named(format!("{name}.queue"))),
            payloads: Mutex::new(payloads),
            state: Mutex::new(AttemptState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, AttemptState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_payload(&self) -> Option<RepeatPayload> {
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next()
    }

    fn max_reached(&self) -> bool {
        let state = self.state();
        state.max.is_some_and(|max| state.count >= max)
    }

    /// Run `payload` on behalf of `owner`.
    ///
    /// Returns the attempt's errors, or `None` when `owner` was cancelled
    /// before the attempt started.
    async fn run(
        &self,
        owner: &Procedure,
        payload: RepeatPayload,
    ) -> Result<Option<Vec<ProcedureError>>, ProcedureError> {
        let RepeatPayload {
            procedure,
            delay,
            configure,
        } = payload;

        if let Some(delay) = delay.filter(|d| !d.is_zero()) {
            let delay = DelayProcedure::procedure(delay);
            self.state().delay = Some(delay.clone());
            if owner.is_cancelled() {
                delay.cancel();
            }
            tracing::trace!(procedure = %owner.id(), delay = %delay.name(), "waiting before next attempt");
            let future = self.queue.add(delay);
            let result = match future {
                Ok(future) => {
                    future.await;
                    Ok(())
                }
                Err(err) => Err(err),
            };
            self.state().delay = None;
            result?;
        }
        if owner.is_cancelled() {
            return Ok(None);
        }

        if let Some(configure) = configure {
            configure(&procedure);
        }
        let count = {
            let mut state = self.state();
            state.count += 1;
            state.current = Some(procedure.clone());
            state.last = Some(procedure.clone());
            state.count
        };
        if owner.is_cancelled() {
            procedure.cancel();
        }
        tracing::debug!(procedure = %owner.id(), attempt = %procedure.id(), count, "starting attempt");

        let future = match self.queue.add(procedure) {
            Ok(future) => future,
            Err(err) => {
                self.state().current = None;
                return Err(err);
            }
        };
        let outcome = future.await;
        let errors = outcome.errors().to_vec();

        let mut state = self.state();
        state.current = None;
        state.attempt_errors = errors.clone();
        state.lifetime_errors.extend(errors.iter().cloned());
        Ok(Some(errors))
    }

    fn cancel_current(&self, errors: &[ProcedureError]) {
        let (current, delay) = {
            let state = self.state();
            (state.current.clone(), state.delay.clone())
        };
        if let Some(delay) = delay {
            delay.cancel();
        }
        if let Some(current) = current {
            match errors.first() {
                Some(cause) => current.cancel_with_error(ProcedureError::ParentCancelled {
                    cause: Box::new(cause.clone()),
                }),
                None => current.cancel(),
            }
        }
    }
}

struct RepeatWork {
    attempts: Arc<Attempts>,
}

#[async_trait]
impl Work for RepeatWork {
    async fn execute(&self, ctx: ProcedureContext) -> Result<(), ProcedureError> {
        let owner = ctx.procedure();
        while !self.attempts.max_reached() {
            let Some(payload) = self.attempts.next_payload() else {
                tracing::debug!(procedure = %owner.id(), "payloads exhausted");
                break;
            };
            let Some(errors) = self.attempts.run(owner, payload).await? else {
                break;
            };
            if owner.is_cancelled() {
                break;
            }
            owner.append_errors(errors);
        }
        Ok(())
    }

    fn did_cancel(&self, _procedure: &Procedure, errors: &[ProcedureError]) {
        self.attempts.cancel_current(errors);
    }
}

/// Runs payloads one after another until they run out or `max` attempts
/// were made. Every attempt's errors are appended to the repeat's errors.
#[derive(Clone)]
pub struct RepeatProcedure {
    procedure: Procedure,
    attempts: Arc<Attempts>,
}

impl RepeatProcedure {
    pub fn new(
        name: impl Into<String>,
        payloads: impl Iterator<Item = RepeatPayload> + Send + 'static,
    ) -> Self {
        let name = name.into();
        let attempts = Arc::new(Attempts::new(&name, Box::new(payloads)));
        let procedure = Procedure::new(
            name,
            RepeatWork {
                attempts: Arc::clone(&attempts),
            },
        );
        Self {
            procedure,
            attempts,
        }
    }

    /// Cap the number of attempts. `max(0)` makes none.
    pub fn max(self, max: usize) -> Self {
        self.attempts.state().max = Some(max);
        self
    }

    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }

    /// Attempts started so far.
    pub fn count(&self) -> usize {
        self.attempts.state().count
    }

    /// Errors of the latest finished attempt.
    pub fn attempt_errors(&self) -> Vec<ProcedureError> {
        self.attempts.state().attempt_errors.clone()
    }

    /// Errors of every finished attempt, oldest first.
    pub fn lifetime_errors(&self) -> Vec<ProcedureError> {
        self.attempts.state().lifetime_errors.clone()
    }

    /// The attempt currently running, if any.
    pub fn current(&self) -> Option<Procedure> {
        self.attempts.state().current.clone()
    }
}

impl fmt::Debug for RepeatProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepeatProcedure")
            .field("procedure", &self.procedure)
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(calls: &Arc<AtomicUsize>, fail: bool) -> Procedure {
        let calls = Arc::clone(calls);
        Procedure::block("attempt", move |_ctx| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if fail {
                    Err(ProcedureError::failed(format!("attempt {n}")))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test]
    async fn repeat_runs_until_payloads_run_out() {
        let calls = Arc::new(AtomicUsize::new(0));
        let payloads: Vec<RepeatPayload> = (0..3)
            .map(|_| RepeatPayload::new(counting(&calls, false)))
            .collect();
        let repeat = RepeatProcedure::new("three", payloads.into_iter());

        let outcome = ProcedureQueue::new()
            .add(repeat.procedure().clone())
            .unwrap()
            .await;

        assert!(outcome.is_success());
        assert_eq!(repeat.count(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn repeat_stops_at_max_and_keeps_every_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let factory_calls = Arc::clone(&calls);
        let repeat = RepeatProcedure::new(
            "capped",
            payloads_from_fn(WaitStrategy::Constant(Duration::from_secs(1)), move || {
                counting(&factory_calls, true)
            }),
        )
        .max(3);
        let started = tokio::time::Instant::now();

        let outcome = ProcedureQueue::new()
            .add(repeat.procedure().clone())
            .unwrap()
            .await;

        assert_eq!(repeat.count(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
        let messages: Vec<String> = outcome.errors().iter().map(ToString::to_string).collect();
        assert_eq!(messages, vec!["attempt 1", "attempt 2", "attempt 3"]);
        assert_eq!(repeat.lifetime_errors().len(), 3);
        assert_eq!(repeat.attempt_errors().len(), 1);
    }

    #[tokio::test]
    async fn configure_runs_before_each_attempt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let attempt = counting(&calls, false);
        let payload = RepeatPayload::new(attempt.clone())
            .with_configure(|procedure| procedure.set_name("configured").unwrap());
        let repeat = RepeatProcedure::new("configured", std::iter::once(payload));

        ProcedureQueue::new()
            .add(repeat.procedure().clone())
            .unwrap()
            .await;

        assert_eq!(attempt.name(), "configured");
    }

    #[tokio::test]
    async fn cancelling_the_repeat_cancels_the_running_attempt() {
        let attempt = Procedure::block("forever", |ctx| async move {
            ctx.cancelled().await;
            Ok(())
        });
        let repeat = RepeatProcedure::new(
            "cancelled",
            std::iter::once(RepeatPayload::new(attempt.clone())),
        );
        let future = ProcedureQueue::new().add(repeat.procedure().clone()).unwrap();

        while !attempt.is_executing() {
            tokio::task::yield_now().await;
        }
        repeat.procedure().cancel();

        assert!(future.await.is_cancelled());
        assert!(attempt.is_cancelled());
        assert!(repeat.current().is_none());
    }

    #[test]
    fn first_generated_payload_has_no_delay() {
        let delays: Vec<Option<Duration>> = payloads_from_fn(
            WaitStrategy::Constant(Duration::from_millis(5)),
            || Procedure::block("p", |_ctx| async { Ok(()) }),
        )
        .take(3)
        .map(|payload| payload.delay)
        .collect();

        assert_eq!(
            delays,
            vec![
                None,
                Some(Duration::from_millis(5)),
                Some(Duration::from_millis(5))
            ]
        );
    }
}
