use super::events::LimiterEvent;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

type SinkFuture = Pin<Box<dyn std::future::Future<Output = Result<(), Infallible>> + Send>>;

/// A telemetry sink that consumes limiter events.
pub trait TelemetrySink:
    tower::Service<LimiterEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
///
/// Admission sits on the request path; a slow or failing sink must never change a decision.
pub async fn emit_best_effort<S>(sink: S, event: LimiterEvent)
where
    S: tower::Service<LimiterEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<LimiterEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: LimiterEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<LimiterEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        match &event {
            LimiterEvent::StoreFailure { .. } => {
                tracing::warn!(target: "tollgate::telemetry", kind = event.kind(), event = %event, "limiter_event")
            }
            _ => tracing::info!(target: "tollgate::telemetry", kind = event.kind(), event = %event, "limiter_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A bounded in-memory sink; the oldest events are evicted first.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<LimiterEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 1024)))),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<LimiterEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect()
    }

    /// Events of one [`LimiterEvent::kind`].
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<LimiterEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: LimiterEvent) -> Self::Future {
        let mut guard = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn denied(id: &str) -> LimiterEvent {
        LimiterEvent::Denied { client_id: id.into(), retry_after: Duration::from_secs(1) }
    }

    #[tokio::test]
    async fn memory_sink_records_and_counts() {
        let sink = MemorySink::new();
        emit_best_effort(sink.clone(), denied("a")).await;
        emit_best_effort(
            sink.clone(),
            LimiterEvent::Admitted { client_id: "b".into(), remaining: 0.0 },
        )
        .await;
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.count("denied"), 1);
        assert_eq!(sink.count("admitted"), 1);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest_when_full() {
        let sink = MemorySink::with_capacity(2);
        for id in ["a", "b", "c"] {
            emit_best_effort(sink.clone(), denied(id)).await;
        }
        let ids: Vec<String> = sink.events().iter().map(|e| e.client_id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(sink.evicted(), 1);
    }

    #[tokio::test]
    async fn default_capacity_keeps_the_newest_events() {
        let sink = MemorySink::new();
        for i in 0..10_050 {
            emit_best_effort(sink.clone(), denied(&i.to_string())).await;
        }
        assert_eq!(sink.len(), 10_000);
        assert_eq!(sink.evicted(), 50);
        let events = sink.events();
        assert_eq!(events.first().map(|e| e.client_id()), Some("50"));
        assert_eq!(events.last().map(|e| e.client_id()), Some("10049"));
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_events() {
        emit_best_effort(NullSink, denied("a")).await;
        emit_best_effort(
            LogSink,
            LimiterEvent::StoreFailure { client_id: "a".into(), error: "timeout".into() },
        )
        .await;
    }
}
