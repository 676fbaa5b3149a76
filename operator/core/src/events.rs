/// Whether an event reports progress or a problem.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Publishes events about the resource a machine is driving.
///
/// Publishing never fails from the caller's point of view; implementations
/// log failures instead.
#[async_trait::async_trait]
pub trait Events: Send + Sync {
    async fn publish(&self, kind: EventKind, reason: &str, note: String);

    async fn normal(&self, reason: &str, note: String) {
        self.publish(EventKind::Normal, reason, note).await
    }

    async fn warning(&self, reason: &str, note: String) {
        self.publish(EventKind::Warning, reason, note).await
    }
}

/// Discards all events.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopEvents;

#[async_trait::async_trait]
impl Events for NoopEvents {
    async fn publish(&self, _: EventKind, _: &str, _: String) {}
}
