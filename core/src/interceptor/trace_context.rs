use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;
use uuid::Uuid;

use crate::context::ConsumeContext;
use crate::errors::HandlerError;
use crate::handler::MessageHandler;
use crate::interceptor::Interceptor;
use crate::message::Batch;

/// Header carrying the request trace id set by producers.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Attaches a trace id and a per-batch log span to the context passed inward.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceContextInterceptor;

impl Interceptor for TraceContextInterceptor {
    fn name(&self) -> &'static str {
        "trace_context"
    }

    fn wrap(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        Arc::new(TraceContextHandler { next })
    }
}

pub struct TraceContextHandler {
    next: Arc<dyn MessageHandler>,
}

/// Header on the first message, then the ambient context, then a fresh id.
pub(crate) fn resolve_trace_id(ctx: &ConsumeContext, batch: &Batch) -> String {
    batch
        .first()
        .header_str(TRACE_ID_HEADER)
        .filter(|id| !id.is_empty())
        .or_else(|| ctx.trace_id().filter(|id| !id.is_empty()))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[async_trait]
impl MessageHandler for TraceContextHandler {
    async fn handle(&self, ctx: &ConsumeContext, batch: &Batch) -> Result<(), HandlerError> {
        let trace_id = resolve_trace_id(ctx, batch);
        let logger = tracing::info_span!(
            parent: ctx.logger(),
            "batch",
            trace_id = %trace_id,
            topic = %batch.topic(),
            partition = batch.partition(),
            first_offset = batch.first_offset(),
            size = batch.len(),
        );
        let ctx = ctx.with_trace_id(trace_id).with_logger(logger.clone());

        // the span is exited and dropped with this future on every path
        self.next.handle(&ctx, batch).instrument(logger).await
    }
}
