//! Tracing and metrics capabilities injected into the listener.
//!
//! Both default to no-op implementations chosen at construction time.

use std::time::Instant;

/// An in-flight trace span.
pub trait Span: Send {
    /// Attaches an attribute to the span.
    fn set_attribute(&mut self, key: &str, value: String);

    /// Records an error on the span.
    fn record_error(&mut self, error: &str);

    /// Ends the span.
    fn finish(self: Box<Self>);
}

/// Starts trace spans.
pub trait Tracer: Send + Sync {
    /// Starts a span with the given name and initial attributes.
    fn start_span(&self, name: &str, attributes: &[(&str, String)]) -> Box<dyn Span>;
}

/// A [`Tracer`] that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

struct NoopSpan;

impl Span for NoopSpan {
    fn set_attribute(&mut self, _key: &str, _value: String) {}
    fn record_error(&mut self, _error: &str) {}
    fn finish(self: Box<Self>) {}
}

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str, _attributes: &[(&str, String)]) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
}

/// A [`Tracer`] that writes span boundaries to the `log` facade at `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

struct LogSpan {
    name: String,
    attributes: Vec<(String, String)>,
    error: Option<String>,
    started: Instant,
}

impl Span for LogSpan {
    fn set_attribute(&mut self, key: &str, value: String) {
        self.attributes.push((key.to_string(), value));
    }

    fn record_error(&mut self, error: &str) {
        self.error = Some(error.to_string());
    }

    fn finish(self: Box<Self>) {
        match &self.error {
            Some(error) => log::debug!(
                "span '{}' finished in {:?} with error '{}' {:?}",
                self.name,
                self.started.elapsed(),
                error,
                self.attributes
            ),
            None => log::debug!(
                "span '{}' finished in {:?} {:?}",
                self.name,
                self.started.elapsed(),
                self.attributes
            ),
        }
    }
}

impl Tracer for LogTracer {
    fn start_span(&self, name: &str, attributes: &[(&str, String)]) -> Box<dyn Span> {
        log::debug!("span '{}' started {:?}", name, attributes);
        Box::new(LogSpan {
            name: name.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            error: None,
            started: Instant::now(),
        })
    }
}

/// Finishes the wrapped span when dropped, including on early return,
/// panic or task cancellation.
pub struct SpanGuard(Option<Box<dyn Span>>);

impl SpanGuard {
    /// Wraps a started span.
    pub fn new(span: Box<dyn Span>) -> Self {
        Self(Some(span))
    }

    /// Attaches an attribute to the span.
    pub fn set_attribute(&mut self, key: &str, value: String) {
        if let Some(span) = self.0.as_mut() {
            span.set_attribute(key, value);
        }
    }

    /// Records an error on the span.
    pub fn record_error(&mut self, error: &str) {
        if let Some(span) = self.0.as_mut() {
            span.record_error(error);
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(span) = self.0.take() {
            span.finish();
        }
    }
}

/// Counters emitted by the listener. Every method defaults to a no-op.
pub trait ListenerMetrics: Send + Sync {
    /// The handler succeeded and the message was acked.
    fn on_success(&self, _subject: &str) {}
    /// The handler failed and the message was left for redelivery.
    fn on_retry(&self, _subject: &str, _attempt: u32) {}
    /// Retries were exhausted and a dead letter was written.
    fn on_dead_letter(&self, _subject: &str) {}
    /// Retries were exhausted with dead-lettering disabled.
    fn on_exhausted(&self, _subject: &str) {}
    /// The message was acked because another replica holds its lock.
    fn on_skip(&self, _subject: &str) {}
    /// The message was acked because its side effect already exists.
    fn on_duplicate(&self, _subject: &str) {}
}

/// [`ListenerMetrics`] that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl ListenerMetrics for NoopMetrics {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSpan(Arc<AtomicUsize>);

    impl Span for CountingSpan {
        fn set_attribute(&mut self, _key: &str, _value: String) {}
        fn record_error(&mut self, _error: &str) {}
        fn finish(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn span_guard_finishes_exactly_once() {
        let finished = Arc::new(AtomicUsize::new(0));
        {
            let mut guard = SpanGuard::new(Box::new(CountingSpan(finished.clone())));
            guard.set_attribute("outcome", "acked".to_string());
        }
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn log_tracer_spans_can_be_finished() {
        let mut span = LogTracer.start_span("handle", &[("subject", "OrderCreated".to_string())]);
        span.set_attribute("event_id", "order-abc123".to_string());
        span.record_error("timeout");
        span.finish();
    }
}
