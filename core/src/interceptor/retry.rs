use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::context::ConsumeContext;
use crate::errors::HandlerError;
use crate::handler::MessageHandler;
use crate::interceptor::Interceptor;
use crate::message::Batch;

/// Retries the inner handler on a fixed interval until it succeeds or the
/// context is cancelled. There is no attempt limit: a permanently failing
/// handler stalls its partition instead of dropping the batch.
#[derive(Debug, Clone, Copy)]
pub struct RetryInterceptor {
    interval: Duration,
}

impl RetryInterceptor {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Interceptor for RetryInterceptor {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn wrap(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        Arc::new(RetryHandler {
            next,
            interval: self.interval,
        })
    }
}

pub struct RetryHandler {
    next: Arc<dyn MessageHandler>,
    interval: Duration,
}

#[async_trait]
impl MessageHandler for RetryHandler {
    async fn handle(&self, ctx: &ConsumeContext, batch: &Batch) -> Result<(), HandlerError> {
        let mut attempt: u64 = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(HandlerError::Cancelled);
            }
            attempt += 1;

            match self.next.handle(ctx, batch).await {
                Ok(()) => return Ok(()),
                Err(HandlerError::Cancelled) => return Err(HandlerError::Cancelled),
                Err(HandlerError::Failed(e)) => {
                    warn!(
                        parent: ctx.logger(),
                        attempt,
                        retry_in_ms = self.interval.as_millis() as u64,
                        error = %e,
                        "handler failed, retrying"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(HandlerError::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::message::test_support::message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn flaky_handler(failures: usize, calls: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(move |_ctx, _batch| {
            let calls = calls.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < failures {
                    Err(HandlerError::Failed(anyhow::anyhow!("attempt {call} failed")))
                } else {
                    Ok(())
                }
            }
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success_on_fixed_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler =
            RetryInterceptor::new(Duration::from_secs(5)).wrap(flaky_handler(3, calls.clone()));

        let started = tokio::time::Instant::now();
        handler
            .handle(&ConsumeContext::background(), &Batch::new(message("t", 0, 0)))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_wait_stops_retrying() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = RetryInterceptor::new(Duration::from_secs(5))
            .wrap(flaky_handler(usize::MAX, calls.clone()));

        let token = CancellationToken::new();
        let ctx = ConsumeContext::new(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            token.cancel();
        });

        let result = handler.handle(&ctx, &Batch::new(message("t", 0, 0))).await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(HandlerError::Cancelled)));
        // attempts at t=0 and t=5; the wait started at t=5 is cut short at t=7
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handler_cancellation_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let handler = RetryInterceptor::new(Duration::from_secs(5)).wrap(Arc::new(handler_fn(
            move |_ctx, _batch| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err::<(), HandlerError>(HandlerError::Cancelled)
                }
            },
        )));

        let result = handler
            .handle(&ConsumeContext::background(), &Batch::new(message("t", 0, 0)))
            .await;

        assert!(matches!(result, Err(HandlerError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_context_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handler =
            RetryInterceptor::new(Duration::from_secs(5)).wrap(flaky_handler(0, calls.clone()));

        let token = CancellationToken::new();
        token.cancel();
        let result = handler
            .handle(&ConsumeContext::new(token), &Batch::new(message("t", 0, 0)))
            .await;

        assert!(matches!(result, Err(HandlerError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
