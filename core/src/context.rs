use tokio_util::sync::CancellationToken;

use crate::tracer::SpanContext;

/// Request-scoped values handed down through the interceptor chain to the handler.
///
/// Cloning is cheap; `with_*` methods return a derived context and leave the
/// original untouched.
#[derive(Debug, Clone)]
pub struct ConsumeContext {
    cancel: CancellationToken,
    trace_id: Option<String>,
    span: Option<SpanContext>,
    logger: tracing::Span,
}

impl ConsumeContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            trace_id: None,
            span: None,
            logger: tracing::Span::none(),
        }
    }

    /// A context that is never cancelled unless its token is cancelled by hand.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Same values, different cancellation scope.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn with_trace_id(&self, trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            ..self.clone()
        }
    }

    /// The active tracing span, if one has been opened for this call.
    pub fn span_context(&self) -> Option<&SpanContext> {
        self.span.as_ref()
    }

    pub fn with_span_context(&self, span: SpanContext) -> Self {
        Self {
            span: Some(span),
            ..self.clone()
        }
    }

    /// Log span for this call; child spans and events created under it inherit
    /// its fields.
    pub fn logger(&self) -> &tracing::Span {
        &self.logger
    }

    pub fn with_logger(&self, logger: tracing::Span) -> Self {
        Self {
            logger,
            ..self.clone()
        }
    }
}

impl Default for ConsumeContext {
    fn default() -> Self {
        Self::background()
    }
}
