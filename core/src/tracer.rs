//! Distributed-tracing seam.
//!
//! The consumer only needs to start spans, link them to parents, and move span
//! contexts in and out of message headers. [`LogTracer`] implements this with
//! W3C `traceparent` headers and reports finished spans through `tracing`;
//! applications wired to a real tracing backend provide their own [`Tracer`].

use std::time::Instant;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::TraceError;
use crate::message::Header;

pub const TRACEPARENT_HEADER: &str = "traceparent";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
}

impl SpanContext {
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: generate_span_id(),
        }
    }

    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: generate_span_id(),
        }
    }

    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }

    pub fn from_traceparent(value: &str) -> Result<Self, TraceError> {
        let malformed = || TraceError::Malformed {
            header: TRACEPARENT_HEADER.to_string(),
            value: value.to_string(),
        };

        let parts: Vec<&str> = value.trim().split('-').collect();
        if parts.len() != 4 {
            return Err(malformed());
        }
        let (trace_id, span_id) = (parts[1], parts[2]);
        if trace_id.len() != 32 || span_id.len() != 16 || !is_hex(trace_id) || !is_hex(span_id) {
            return Err(malformed());
        }
        // all-zero ids are invalid in W3C trace context
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return Err(malformed());
        }

        Ok(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: span_id.to_ascii_lowercase(),
        })
    }
}

fn generate_span_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanReference {
    ChildOf(SpanContext),
    FollowsFrom(SpanContext),
}

impl SpanReference {
    pub fn context(&self) -> &SpanContext {
        match self {
            SpanReference::ChildOf(ctx) | SpanReference::FollowsFrom(ctx) => ctx,
        }
    }
}

pub trait Span: Send {
    fn context(&self) -> SpanContext;

    fn set_tag(&mut self, key: &'static str, value: String);

    fn set_error(&mut self, error: &(dyn std::error::Error + 'static));

    fn finish(self: Box<Self>);
}

pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str, references: &[SpanReference]) -> Box<dyn Span>;

    /// Span context carried in `headers`, if any.
    fn extract(&self, headers: &[Header]) -> Result<Option<SpanContext>, TraceError>;

    fn inject(&self, span: &SpanContext) -> Vec<Header>;
}

/// Finishes the wrapped span exactly once: explicitly via [`SpanGuard::finish`],
/// or on drop when the owning future is abandoned.
pub struct SpanGuard {
    span: Option<Box<dyn Span>>,
}

impl SpanGuard {
    pub fn new(span: Box<dyn Span>) -> Self {
        Self { span: Some(span) }
    }

    pub fn context(&self) -> Option<SpanContext> {
        self.span.as_ref().map(|s| s.context())
    }

    pub fn set_tag(&mut self, key: &'static str, value: impl ToString) {
        if let Some(span) = self.span.as_mut() {
            span.set_tag(key, value.to_string());
        }
    }

    pub fn set_error(&mut self, error: &(dyn std::error::Error + 'static)) {
        if let Some(span) = self.span.as_mut() {
            span.set_error(error);
        }
    }

    pub fn finish(mut self) {
        if let Some(span) = self.span.take() {
            span.finish();
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            span.finish();
        }
    }
}

/// Tracer that propagates `traceparent` headers and logs finished spans.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

struct LogSpan {
    name: String,
    context: SpanContext,
    parents: Vec<SpanContext>,
    tags: Vec<(&'static str, String)>,
    error: Option<String>,
    started: Instant,
}

impl Tracer for LogTracer {
    fn start_span(&self, name: &str, references: &[SpanReference]) -> Box<dyn Span> {
        // the first reference decides which trace the span joins
        let context = match references.first() {
            Some(reference) => reference.context().child(),
            None => SpanContext::new_root(),
        };

        Box::new(LogSpan {
            name: name.to_string(),
            context,
            parents: references.iter().map(|r| r.context().clone()).collect(),
            tags: vec![],
            error: None,
            started: Instant::now(),
        })
    }

    fn extract(&self, headers: &[Header]) -> Result<Option<SpanContext>, TraceError> {
        let Some(header) = headers.iter().find(|h| h.key == TRACEPARENT_HEADER) else {
            return Ok(None);
        };
        let value = String::from_utf8_lossy(&header.value);
        SpanContext::from_traceparent(&value).map(Some)
    }

    fn inject(&self, span: &SpanContext) -> Vec<Header> {
        vec![Header::new(TRACEPARENT_HEADER, span.to_traceparent())]
    }
}

impl Span for LogSpan {
    fn context(&self) -> SpanContext {
        self.context.clone()
    }

    fn set_tag(&mut self, key: &'static str, value: String) {
        self.tags.push((key, value));
    }

    fn set_error(&mut self, error: &(dyn std::error::Error + 'static)) {
        self.error = Some(error.to_string());
    }

    fn finish(self: Box<Self>) {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        let parents: Vec<&str> = self.parents.iter().map(|p| p.span_id.as_str()).collect();
        match &self.error {
            Some(error) => warn!(
                span = %self.name,
                trace_id = %self.context.trace_id,
                span_id = %self.context.span_id,
                parents = ?parents,
                tags = ?self.tags,
                duration_ms,
                error = %error,
                "span finished with error"
            ),
            None => debug!(
                span = %self.name,
                trace_id = %self.context.trace_id,
                span_id = %self.context.span_id,
                parents = ?parents,
                tags = ?self.tags,
                duration_ms,
                "span finished"
            ),
        }
    }
}

/// Tracer that records nothing and propagates nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

struct NoopSpan(SpanContext);

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str, references: &[SpanReference]) -> Box<dyn Span> {
        let context = match references.first() {
            Some(reference) => reference.context().clone(),
            None => SpanContext {
                trace_id: "0".repeat(32),
                span_id: "0".repeat(16),
            },
        };
        Box::new(NoopSpan(context))
    }

    fn extract(&self, _headers: &[Header]) -> Result<Option<SpanContext>, TraceError> {
        Ok(None)
    }

    fn inject(&self, _span: &SpanContext) -> Vec<Header> {
        vec![]
    }
}

impl Span for NoopSpan {
    fn context(&self) -> SpanContext {
        self.0.clone()
    }

    fn set_tag(&mut self, _key: &'static str, _value: String) {}

    fn set_error(&mut self, _error: &(dyn std::error::Error + 'static)) {}

    fn finish(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_traceparent_roundtrip_through_headers() {
        let tracer = LogTracer;
        let ctx = SpanContext::new_root();
        assert_eq!(ctx.trace_id.len(), 32);
        assert_eq!(ctx.span_id.len(), 16);

        let headers = tracer.inject(&ctx);
        assert_eq!(headers[0].key, TRACEPARENT_HEADER);

        let extracted = tracer.extract(&headers).unwrap();
        assert_eq!(extracted, Some(ctx));
    }

    #[test]
    fn test_extract_without_header_is_none() {
        let headers = vec![Header::new("x-trace-id", "abc")];
        assert_eq!(LogTracer.extract(&headers), Ok(None));
    }

    #[test]
    fn test_traceparent_parse_invalid() {
        assert!(SpanContext::from_traceparent("").is_err());
        assert!(SpanContext::from_traceparent("00-abc").is_err());
        assert!(SpanContext::from_traceparent("00-xyz-0102030405060708-01").is_err());
        assert!(
            SpanContext::from_traceparent(&format!("00-{}-{}-01", "0".repeat(32), "1".repeat(16)))
                .is_err()
        );

        let headers = vec![Header::new(TRACEPARENT_HEADER, "garbage")];
        assert!(LogTracer.extract(&headers).is_err());
    }

    #[test]
    fn test_child_span_joins_first_parent_trace() {
        let producer = SpanContext::new_root();
        let ambient = SpanContext::new_root();
        let span = LogTracer.start_span(
            "consume",
            &[
                SpanReference::ChildOf(producer.clone()),
                SpanReference::ChildOf(ambient),
            ],
        );

        let ctx = span.context();
        assert_eq!(ctx.trace_id, producer.trace_id);
        assert_ne!(ctx.span_id, producer.span_id);
        span.finish();
    }

    struct CountingSpan(Arc<AtomicUsize>);

    impl Span for CountingSpan {
        fn context(&self) -> SpanContext {
            SpanContext::new_root()
        }
        fn set_tag(&mut self, _key: &'static str, _value: String) {}
        fn set_error(&mut self, _error: &(dyn std::error::Error + 'static)) {}
        fn finish(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_span_guard_finishes_exactly_once() {
        let finished = Arc::new(AtomicUsize::new(0));

        let guard = SpanGuard::new(Box::new(CountingSpan(finished.clone())));
        guard.finish();
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        {
            let _guard = SpanGuard::new(Box::new(CountingSpan(finished.clone())));
        }
        assert_eq!(finished.load(Ordering::SeqCst), 2);
    }
}
