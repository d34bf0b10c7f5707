//! Middleware around the user handler.
//!
//! Interceptors are kept as an ordered list and folded right-to-left into one
//! handler when a consumer is built, so the first interceptor in the list is the
//! outermost at call time:
//!
//! ```text
//! trace context -> retry -> span -> user interceptors -> handler
//! ```

mod retry;
mod span;
mod trace_context;

use std::sync::Arc;
use std::time::Duration;

pub use retry::{RetryHandler, RetryInterceptor};
pub use span::{SpanHandler, SpanInterceptor};
pub use trace_context::{TRACE_ID_HEADER, TraceContextHandler, TraceContextInterceptor};

use crate::handler::MessageHandler;
use crate::tracer::Tracer;

pub trait Interceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn wrap(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler>;
}

#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trace-context preparation, retry-until-success, then span management.
    pub fn standard(retry_interval: Duration, tracer: Arc<dyn Tracer>) -> Self {
        Self::new()
            .with(TraceContextInterceptor)
            .with(RetryInterceptor::new(retry_interval))
            .with(SpanInterceptor::new(tracer))
    }

    /// Appends an interceptor; it runs inside every interceptor added before it.
    pub fn with(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn with_shared(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn compose(&self, handler: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        self.interceptors
            .iter()
            .rev()
            .fold(handler, |next, interceptor| interceptor.wrap(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConsumeContext;
    use crate::errors::HandlerError;
    use crate::handler::handler_fn;
    use crate::message::Batch;
    use crate::message::test_support::message;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingHandler {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        next: Arc<dyn MessageHandler>,
    }

    impl Interceptor for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn wrap(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
            Arc::new(RecordingHandler {
                name: self.name,
                log: self.log.clone(),
                next,
            })
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, ctx: &ConsumeContext, batch: &Batch) -> Result<(), HandlerError> {
            self.log.lock().unwrap().push(format!("enter {}", self.name));
            let result = self.next.handle(ctx, batch).await;
            self.log.lock().unwrap().push(format!("exit {}", self.name));
            result
        }
    }

    #[tokio::test]
    async fn test_chain_runs_outer_to_inner_in_list_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ["first", "second", "third"]
            .into_iter()
            .fold(InterceptorChain::new(), |chain, name| {
                chain.with(Recording {
                    name,
                    log: log.clone(),
                })
            });
        assert_eq!(chain.names(), vec!["first", "second", "third"]);

        let handler_log = log.clone();
        let handler = chain.compose(Arc::new(handler_fn(move |_ctx, _batch| {
            let log = handler_log.clone();
            async move {
                log.lock().unwrap().push("handler".to_string());
                Ok::<(), HandlerError>(())
            }
        })));

        handler
            .handle(&ConsumeContext::background(), &Batch::new(message("t", 0, 0)))
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "enter first",
                "enter second",
                "enter third",
                "handler",
                "exit third",
                "exit second",
                "exit first",
            ]
        );
    }

    #[test]
    fn test_standard_chain_order() {
        let chain = InterceptorChain::standard(
            Duration::from_secs(5),
            Arc::new(crate::tracer::NoopTracer),
        );
        assert_eq!(chain.names(), vec!["trace_context", "retry", "span"]);
    }
}
