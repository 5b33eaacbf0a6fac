//! Ready-made `Work` implementations.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::{Procedure, ProcedureContext, Work};
use crate::error::ProcedureError;

/// Work backed by an async closure.
pub struct BlockProcedure<F> {
    block: F,
}

impl<F> BlockProcedure<F> {
    pub fn new(block: F) -> Self {
        Self { block }
    }
}

#[async_trait]
impl<F, Fut> Work for BlockProcedure<F>
where
    F: Fn(ProcedureContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcedureError>> + Send + 'static,
{
    async fn execute(&self, ctx: ProcedureContext) -> Result<(), ProcedureError> {
        (self.block)(ctx).await
    }
}

/// Waits for a fixed duration, or until cancelled.
#[derive(Debug, Clone, Copy)]
pub struct DelayProcedure {
    delay: Duration,
}

impl DelayProcedure {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Wrap into a procedure named after the delay.
    pub fn procedure(delay: Duration) -> Procedure {
        Procedure::new(format!("Delay({delay:?})"), Self::new(delay))
    }
}

#[async_trait]
impl Work for DelayProcedure {
    async fn execute(&self, ctx: ProcedureContext) -> Result<(), ProcedureError> {
        if self.delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = ctx.cancelled() => {
                tracing::trace!(procedure = %ctx.id(), "delay cut short by cancellation");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ProcedureQueue;

    #[tokio::test(start_paused = true)]
    async fn delay_waits_for_its_duration() {
        let queue = ProcedureQueue::new();
        let started = tokio::time::Instant::now();

        let outcome = queue
            .add(DelayProcedure::procedure(Duration::from_secs(5)))
            .unwrap()
            .await;

        assert!(outcome.is_success());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_delay_finishes_immediately() {
        let queue = ProcedureQueue::new();
        let delay = DelayProcedure::procedure(Duration::from_secs(3600));
        let future = queue.add(delay.clone()).unwrap();

        while !delay.is_executing() {
            tokio::task::yield_now().await;
        }
        let started = tokio::time::Instant::now();
        delay.cancel();

        assert!(future.await.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
