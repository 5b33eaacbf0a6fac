//! Retry: repeat until an attempt finishes without errors.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Attempts, RepeatPayload};
use crate::error::ProcedureError;
use crate::procedure::{Procedure, ProcedureContext, Work};

/// What a decider knows about the failed attempt.
#[derive(Debug, Clone)]
pub struct RetryFailureInfo {
    /// The attempt that failed.
    pub procedure: Procedure,
    /// Attempts made so far, including this one.
    pub count: usize,
    pub errors: Vec<ProcedureError>,
    pub lifetime_errors: Vec<ProcedureError>,
}

/// Decides whether a failed attempt is retried.
///
/// Gets the recommended next payload and returns the payload to run, or
/// `None` to stop retrying. Must not block.
pub trait RetryDecider: Send + Sync + 'static {
    fn decide(&self, info: &RetryFailureInfo, recommended: RepeatPayload) -> Option<RepeatPayload>;
}

/// Always follows the recommendation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryDecider;

impl RetryDecider for DefaultRetryDecider {
    fn decide(&self, _info: &RetryFailureInfo, recommended: RepeatPayload) -> Option<RepeatPayload> {
        Some(recommended)
    }
}

impl<F> RetryDecider for F
where
    F: Fn(&RetryFailureInfo, RepeatPayload) -> Option<RepeatPayload> + Send + Sync + 'static,
{
    fn decide(&self, info: &RetryFailureInfo, recommended: RepeatPayload) -> Option<RepeatPayload> {
        self(info, recommended)
    }
}

type SharedDecider = Arc<Mutex<Arc<dyn RetryDecider>>>;

struct RetryWork {
    attempts: Arc<Attempts>,
    decider: SharedDecider,
}

impl RetryWork {
    /// The payload for the attempt after a failed one, if any.
    fn next_after_failure(&self, errors: &[ProcedureError]) -> Option<RepeatPayload> {
        if self.attempts.max_reached() {
            return None;
        }
        let recommended = self.attempts.next_payload()?;
        let info = {
            let state = self.attempts.state();
            RetryFailureInfo {
                procedure: state.last.clone()?,
                count: state.count,
                errors: errors.to_vec(),
                lifetime_errors: state.lifetime_errors.clone(),
            }
        };
        let decider = Arc::clone(&self.decider.lock().unwrap_or_else(|e| e.into_inner()));
        decider.decide(&info, recommended)
    }
}

#[async_trait]
impl Work for RetryWork {
    async fn execute(&self, ctx: ProcedureContext) -> Result<(), ProcedureError> {
        let owner = ctx.procedure();
        if self.attempts.max_reached() {
            return Ok(());
        }
        let Some(mut payload) = self.attempts.next_payload() else {
            return Ok(());
        };

        loop {
            let Some(errors) = self.attempts.run(owner, payload).await? else {
                // cancelled while waiting: report the previous attempt
                let errors = self.attempts.state().attempt_errors.clone();
                owner.append_errors(errors);
                break;
            };
            if owner.is_cancelled() {
                break;
            }
            if errors.is_empty() {
                tracing::debug!(procedure = %owner.id(), count = self.attempts.state().count, "attempt succeeded");
                break;
            }
            match self.next_after_failure(&errors) {
                Some(next) => {
                    tracing::debug!(procedure = %owner.id(), errors = errors.len(), "retrying failed attempt");
                    payload = next;
                }
                None => {
                    tracing::debug!(procedure = %owner.id(), errors = errors.len(), "giving up");
                    owner.append_errors(errors);
                    break;
                }
            }
        }
        Ok(())
    }

    fn did_cancel(&self, _procedure: &Procedure, errors: &[ProcedureError]) {
        self.attempts.cancel_current(errors);
    }
}

/// Runs payloads until one finishes without errors.
///
/// After a failure the next attempt runs only if fewer than `max` attempts
/// were made, the payloads are not exhausted and the decider agrees. When
/// retrying stops, the retry finishes with the last attempt's errors.
///
/// # Example
/// ```ignore
/// let retry = RetryProcedure::new(
///     "fetch",
///     payloads_from_fn(WaitStrategy::Exponential { period, max }, make_fetch),
/// )
/// .max(5);
/// queue.add(retry.procedure().clone())?.await;
/// ```
#[derive(Clone)]
pub struct RetryProcedure {
    procedure: Procedure,
    attempts: Arc<Attempts>,
    decider: SharedDecider,
}

impl RetryProcedure {
    pub fn new(
        name: impl Into<String>,
        payloads: impl Iterator<Item = RepeatPayload> + Send + 'static,
    ) -> Self {
        let name = name.into();
        let attempts = Arc::new(Attempts::new(&name, Box::new(payloads)));
        let decider: SharedDecider = Arc::new(Mutex::new(Arc::new(DefaultRetryDecider)));
        let procedure = Procedure::new(
            name,
            RetryWork {
                attempts: Arc::clone(&attempts),
                decider: Arc::clone(&decider),
            },
        );
        Self {
            procedure,
            attempts,
            decider,
        }
    }

    /// Cap the number of attempts.
    pub fn max(self, max: usize) -> Self {
        self.attempts.state().max = Some(max);
        self
    }

    pub fn with_handler(self, decider: impl RetryDecider) -> Self {
        *self.decider.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(decider);
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
}

impl fmt::Debug for RetryProcedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryProcedure")
            .field("procedure", &self.procedure)
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::queue::ProcedureQueue;
    use crate::repeat::{WaitStrategy, payloads_from_fn};

    /// Attempts failing until `failures` of them failed.
    fn flaky(failures: usize) -> impl FnMut() -> Procedure + Send + 'static {
        let calls = Arc::new(AtomicUsize::new(0));
        move || {
            let calls = Arc::clone(&calls);
            Procedure::block("flaky", move |_ctx| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n <= failures {
                        Err(ProcedureError::failed(format!("attempt {n}")))
                    } else {
                        Ok(())
                    }
                }
            })
        }
    }

    fn wait() -> WaitStrategy {
        WaitStrategy::Constant(Duration::from_millis(10))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_the_third_attempt() {
        let retry = RetryProcedure::new("flaky", payloads_from_fn(wait(), flaky(2))).max(5);

        let outcome = ProcedureQueue::new()
            .add(retry.procedure().clone())
            .unwrap()
            .await;

        assert!(outcome.is_success());
        assert_eq!(retry.count(), 3);
        assert!(retry.attempt_errors().is_empty());
        assert_eq!(retry.lifetime_errors().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retry_reports_the_last_attempt() {
        let retry = RetryProcedure::new("broken", payloads_from_fn(wait(), flaky(usize::MAX))).max(3);

        let outcome = ProcedureQueue::new()
            .add(retry.procedure().clone())
            .unwrap()
            .await;

        assert_eq!(retry.count(), 3);
        let messages: Vec<String> = outcome.errors().iter().map(ToString::to_string).collect();
        assert_eq!(messages, vec!["attempt 3"]);
        assert_eq!(retry.lifetime_errors().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_payloads_stop_retrying() {
        let mut factory = flaky(usize::MAX);
        let payloads: Vec<RepeatPayload> = (0..2).map(|_| RepeatPayload::new(factory())).collect();
        let retry = RetryProcedure::new("two", payloads.into_iter());

        let outcome = ProcedureQueue::new()
            .add(retry.procedure().clone())
            .unwrap()
            .await;

        assert_eq!(retry.count(), 2);
        assert!(outcome.is_failure());
    }

    #[tokio::test]
    async fn handler_returning_none_stops() {
        let retry = RetryProcedure::new(
            "refused",
            payloads_from_fn(WaitStrategy::Immediate, flaky(usize::MAX)),
        )
        .max(5)
        .with_handler(|_info: &RetryFailureInfo, _next: RepeatPayload| None);

        let outcome = ProcedureQueue::new()
            .add(retry.procedure().clone())
            .unwrap()
            .await;

        assert_eq!(retry.count(), 1);
        assert_eq!(outcome.errors().len(), 1);
    }

    #[tokio::test]
    async fn handler_sees_each_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let retry = RetryProcedure::new(
            "observed",
            payloads_from_fn(WaitStrategy::Immediate, flaky(2)),
        )
        .with_handler(move |info: &RetryFailureInfo, next: RepeatPayload| {
            sink.lock()
                .unwrap()
                .push((info.count, info.lifetime_errors.len()));
            Some(next)
        });

        let outcome = ProcedureQueue::new()
            .add(retry.procedure().clone())
            .unwrap()
            .await;

        assert!(outcome.is_success());
        assert_eq!(*seen.lock().unwrap(), vec![(1, 1), (2, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_delay_finishes_immediately() {
        let retry = RetryProcedure::new(
            "waiting",
            payloads_from_fn(
                WaitStrategy::Constant(Duration::from_secs(3600)),
                flaky(usize::MAX),
            ),
        );
        let future = ProcedureQueue::new().add(retry.procedure().clone()).unwrap();

        while retry.attempts.state().delay.is_none() {
            tokio::task::yield_now().await;
        }
        let started = tokio::time::Instant::now();
        retry.procedure().cancel();
        let outcome = future.await;

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(retry.count(), 1);
        let messages: Vec<String> = outcome.errors().iter().map(ToString::to_string).collect();
        assert_eq!(messages, vec!["attempt 1"]);
    }
}
