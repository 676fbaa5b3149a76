use crate::core::{EventKind, Events};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Shows up as the reporting component of published events.
pub const REPORTER: &str = "gefyra-operator";

/// Publishes events about a single object.
pub struct KubeEvents {
    recorder: Recorder,
    reference: ObjectReference,
}

impl KubeEvents {
    pub fn new(client: kube::Client, reference: ObjectReference) -> Self {
        let reporter = Reporter {
            controller: REPORTER.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            reference,
        }
    }
}

#[async_trait::async_trait]
impl Events for KubeEvents {
    async fn publish(&self, kind: EventKind, reason: &str, note: String) {
        let event = Event {
            type_: match kind {
                EventKind::Normal => EventType::Normal,
                EventKind::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, &self.reference).await {
            warn!(%reason, %error, "Failed to publish event");
        }
    }
}
