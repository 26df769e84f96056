use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use shared::domain::{SinkInvocation, SinkKind};
use storage::UnreadStore;
use tracing::{info, warn};

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn kind(&self) -> SinkKind;
    async fn deliver(&self, invocation: &SinkInvocation) -> Result<()>;
}

pub struct UnreadCounterSink {
    store: Arc<dyn UnreadStore>,
}

impl UnreadCounterSink {
    pub fn new(store: Arc<dyn UnreadStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationSink for UnreadCounterSink {
    fn kind(&self) -> SinkKind {
        SinkKind::UnreadCounter
    }

    async fn deliver(&self, invocation: &SinkInvocation) -> Result<()> {
        self.store
            .increment(invocation.role, &invocation.topic_id)
            .await?;
        Ok(())
    }
}

/// Records the delivery in the log. Used for the sinks whose rendering
/// belongs to the UI layer, which receives the same invocations through the
/// qualifying-event callbacks.
pub struct TracingSink {
    kind: SinkKind,
}

impl TracingSink {
    pub fn new(kind: SinkKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl NotificationSink for TracingSink {
    fn kind(&self) -> SinkKind {
        self.kind
    }

    async fn deliver(&self, invocation: &SinkInvocation) -> Result<()> {
        info!(
            sink = ?self.kind,
            topic_id = %invocation.topic_id,
            event_id = %invocation.event_id,
            title = %invocation.title,
            "notification delivered"
        );
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: Vec<(SinkKind, String)>,
    pub unhandled: Vec<SinkKind>,
}

/// Executes router decisions. Every sink runs independently; a failing sink
/// is logged and never affects the others or the caller.
#[derive(Default)]
pub struct SinkDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl SinkDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unread counters go to `store`; the other kinds are logged.
    pub fn with_defaults(store: Arc<dyn UnreadStore>) -> Self {
        Self::new()
            .with_sink(Arc::new(TracingSink::new(SinkKind::Audible)))
            .with_sink(Arc::new(TracingSink::new(SinkKind::Banner)))
            .with_sink(Arc::new(TracingSink::new(SinkKind::OsNotification)))
            .with_sink(Arc::new(UnreadCounterSink::new(store)))
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn register(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub async fn dispatch(&self, invocations: &[SinkInvocation]) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut deliveries = Vec::new();

        for invocation in invocations {
            let mut handled = false;
            for sink in self.sinks.iter().filter(|sink| sink.kind() == invocation.sink) {
                handled = true;
                let sink = Arc::clone(sink);
                deliveries.push(async move { (sink.kind(), sink.deliver(invocation).await) });
            }
            if !handled {
                report.unhandled.push(invocation.sink);
            }
        }

        for (kind, outcome) in join_all(deliveries).await {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(sink = ?kind, %err, "sink delivery failed");
                    report.failed.push((kind, err.to_string()));
                }
            }
        }

        report
    }
}

#[cfg(test)]
#[path = "tests/sinks_tests.rs"]
mod tests;
