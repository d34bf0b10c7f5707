use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::ConsumeContext;
use crate::errors::HandlerError;
use crate::message::Batch;

/// Processes one batch. Must be idempotent: delivery is at-least-once and a
/// batch is redelivered if the process stops between success and commit.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &ConsumeContext, batch: &Batch) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, ctx: &ConsumeContext, batch: &Batch) -> Result<(), HandlerError> {
        (**self).handle(ctx, batch).await
    }
}

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(ConsumeContext, Batch) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(ConsumeContext, Batch) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, ctx: &ConsumeContext, batch: &Batch) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), batch.clone()).await
    }
}
