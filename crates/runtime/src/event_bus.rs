use assets::FallbackReason;
use catalog::SourceTier;
use foundation::{AssetId, JobId, Timestamp};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::job::JobState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: JobId,
    pub at: Timestamp,
    #[serde(flatten)]
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobEventKind {
    StateChanged { from: JobState, to: JobState },
    Progress { progress: u8, stage: String },
    #[serde(rename_all = "camelCase")]
    AssetResolved {
        asset_id: AssetId,
        source_used: SourceTier,
        from_cache: bool,
        fallback_reason: Option<FallbackReason>,
    },
}

/// Fan-out of job events to any number of subscribers.
///
/// Every subscriber sees events in publish order. Receivers that have been
/// dropped are pruned on the next publish.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<JobEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: JobEvent) {
        let mut subs = self.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use foundation::{JobId, Timestamp};

    use super::{EventBus, JobEvent, JobEventKind};
    use crate::job::JobState;

    fn changed(job_id: JobId, from: JobState, to: JobState) -> JobEvent {
        JobEvent {
            job_id,
            at: Timestamp(0),
            kind: JobEventKind::StateChanged { from, to },
        }
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        let id = JobId::generate();

        bus.publish(changed(id, JobState::Submitted, JobState::Queued));
        bus.publish(changed(id, JobState::Queued, JobState::Rendering));

        for rx in [&mut a, &mut b] {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            assert!(matches!(first.kind, JobEventKind::StateChanged { to: JobState::Queued, .. }));
            assert!(matches!(second.kind, JobEventKind::StateChanged { to: JobState::Rendering, .. }));
        }
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let _keep = bus.subscribe();
        drop(rx);

        bus.publish(changed(JobId::generate(), JobState::Submitted, JobState::Queued));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn events_serialize_flat() {
        let id = JobId::generate();
        let json = serde_json::to_value(changed(id, JobState::Queued, JobState::Cancelled)).unwrap();
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["to"], "cancelled");
        assert_eq!(json["jobId"], id.to_string());
    }
}
