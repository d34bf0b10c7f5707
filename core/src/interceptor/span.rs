use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::context::ConsumeContext;
use crate::errors::HandlerError;
use crate::handler::MessageHandler;
use crate::interceptor::Interceptor;
use crate::message::Batch;
use crate::tracer::{SpanGuard, SpanReference, Tracer};

pub const CONSUME_SPAN_NAME: &str = "kafka.consume";

/// Opens one tracing span per invocation, parented on the producer span found
/// in the first message's headers and on the ambient span of the context.
pub struct SpanInterceptor {
    tracer: Arc<dyn Tracer>,
}

impl SpanInterceptor {
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self { tracer }
    }
}

impl Interceptor for SpanInterceptor {
    fn name(&self) -> &'static str {
        "span"
    }

    fn wrap(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        Arc::new(SpanHandler {
            next,
            tracer: self.tracer.clone(),
        })
    }
}

pub struct SpanHandler {
    next: Arc<dyn MessageHandler>,
    tracer: Arc<dyn Tracer>,
}

impl SpanHandler {
    fn references(&self, ctx: &ConsumeContext, batch: &Batch) -> Vec<SpanReference> {
        let mut references = Vec::with_capacity(2);
        match self.tracer.extract(&batch.first().headers) {
            Ok(Some(producer)) => references.push(SpanReference::ChildOf(producer)),
            Ok(None) => {}
            Err(e) => debug!(parent: ctx.logger(), error = %e, "ignoring producer span"),
        }
        if let Some(ambient) = ctx.span_context() {
            references.push(SpanReference::ChildOf(ambient.clone()));
        }
        references
    }
}

#[async_trait]
impl MessageHandler for SpanHandler {
    async fn handle(&self, ctx: &ConsumeContext, batch: &Batch) -> Result<(), HandlerError> {
        let references = self.references(ctx, batch);
        let mut span = SpanGuard::new(self.tracer.start_span(CONSUME_SPAN_NAME, &references));
        span.set_tag("topic", batch.topic());
        span.set_tag("partition", batch.partition());
        span.set_tag("offset", batch.first_offset());
        span.set_tag("batch_size", batch.len());

        let ctx = match span.context() {
            Some(active) => ctx.with_span_context(active),
            None => ctx.clone(),
        };

        let result = self.next.handle(&ctx, batch).await;
        if let Err(HandlerError::Failed(e)) = &result {
            span.set_error(&**e);
        }
        span.finish();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TraceError;
    use crate::handler::handler_fn;
    use crate::message::Header;
    use crate::message::test_support::{message, message_with_headers};
    use crate::tracer::{LogTracer, Span, SpanContext};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Recorded {
        started: Vec<Vec<SpanReference>>,
        tags: Vec<(&'static str, String)>,
        errors: Vec<String>,
        finished: usize,
    }

    #[derive(Default, Clone)]
    struct RecordingTracer {
        recorded: Arc<Mutex<Recorded>>,
    }

    struct RecordingSpan {
        context: SpanContext,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl Tracer for RecordingTracer {
        fn start_span(&self, _name: &str, references: &[SpanReference]) -> Box<dyn Span> {
            self.recorded.lock().unwrap().started.push(references.to_vec());
            Box::new(RecordingSpan {
                context: SpanContext::new_root(),
                recorded: self.recorded.clone(),
            })
        }

        fn extract(&self, headers: &[Header]) -> Result<Option<SpanContext>, TraceError> {
            LogTracer.extract(headers)
        }

        fn inject(&self, span: &SpanContext) -> Vec<Header> {
            LogTracer.inject(span)
        }
    }

    impl Span for RecordingSpan {
        fn context(&self) -> SpanContext {
            self.context.clone()
        }

        fn set_tag(&mut self, key: &'static str, value: String) {
            self.recorded.lock().unwrap().tags.push((key, value));
        }

        fn set_error(&mut self, error: &(dyn std::error::Error + 'static)) {
            self.recorded.lock().unwrap().errors.push(error.to_string());
        }

        fn finish(self: Box<Self>) {
            self.recorded.lock().unwrap().finished += 1;
        }
    }

    fn ok_handler() -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(|_ctx, _batch| async { Ok::<(), HandlerError>(()) }))
    }

    #[tokio::test]
    async fn test_span_parents_on_producer_and_ambient_spans() {
        let tracer = RecordingTracer::default();
        let handler = SpanInterceptor::new(Arc::new(tracer.clone())).wrap(ok_handler());

        let producer = SpanContext::new_root();
        let ambient = SpanContext::new_root();
        let batch = Batch::new(message_with_headers(
            "orders",
            3,
            42,
            LogTracer.inject(&producer),
        ));
        let ctx = ConsumeContext::background().with_span_context(ambient.clone());

        handler.handle(&ctx, &batch).await.unwrap();

        let recorded = tracer.recorded.lock().unwrap();
        assert_eq!(
            recorded.started,
            vec![vec![
                SpanReference::ChildOf(producer),
                SpanReference::ChildOf(ambient),
            ]]
        );
        assert!(recorded.tags.contains(&("topic", "orders".to_string())));
        assert!(recorded.tags.contains(&("partition", "3".to_string())));
        assert!(recorded.tags.contains(&("offset", "42".to_string())));
        assert!(recorded.tags.contains(&("batch_size", "1".to_string())));
        assert!(recorded.errors.is_empty());
        assert_eq!(recorded.finished, 1);
    }

    #[tokio::test]
    async fn test_failed_handler_marks_span_errored() {
        let tracer = RecordingTracer::default();
        let handler = SpanInterceptor::new(Arc::new(tracer.clone())).wrap(Arc::new(handler_fn(
            |_ctx, _batch| async {
                Err::<(), HandlerError>(HandlerError::Failed(anyhow::anyhow!("boom")))
            },
        )));

        let result = handler
            .handle(&ConsumeContext::background(), &Batch::new(message("t", 0, 0)))
            .await;

        assert!(result.is_err());
        let recorded = tracer.recorded.lock().unwrap();
        assert_eq!(recorded.errors, vec!["boom".to_string()]);
        assert_eq!(recorded.finished, 1);
        assert!(recorded.started[0].is_empty());
    }

    #[tokio::test]
    async fn test_span_finished_when_future_is_dropped() {
        let tracer = RecordingTracer::default();
        let handler = SpanInterceptor::new(Arc::new(tracer.clone())).wrap(Arc::new(handler_fn(
            |ctx: ConsumeContext, _batch| async move {
                ctx.cancelled().await;
                Err::<(), HandlerError>(HandlerError::Cancelled)
            },
        )));

        let token = CancellationToken::new();
        let ctx = ConsumeContext::new(token);
        let batch = Batch::new(message("t", 0, 0));
        let call = handler.handle(&ctx, &batch);
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(10), call).await;
        assert!(outcome.is_err());

        let recorded = tracer.recorded.lock().unwrap();
        assert_eq!(recorded.finished, 1);
        assert!(recorded.errors.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_producer_header_is_ignored() {
        let tracer = RecordingTracer::default();
        let handler = SpanInterceptor::new(Arc::new(tracer.clone())).wrap(ok_handler());

        let batch = Batch::new(message_with_headers(
            "t",
            0,
            0,
            vec![Header::new(crate::tracer::TRACEPARENT_HEADER, "nope")],
        ));
        handler
            .handle(&ConsumeContext::background(), &batch)
            .await
            .unwrap();

        let recorded = tracer.recorded.lock().unwrap();
        assert!(recorded.started[0].is_empty());
        assert_eq!(recorded.finished, 1);
    }
}
