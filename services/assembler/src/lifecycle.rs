//! Lifecycle event publisher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use plexus_events::{EventEnvelope, LifecycleEvent};
use plexus_id::{ApplicationId, EventId, Phase, SystemId};
use tokio::sync::broadcast;
use tracing::{trace, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// Fans lifecycle events out to subscribers. Publishing never blocks; slow
/// subscribers lose the oldest events.
#[derive(Clone)]
pub struct LifecyclePublisher {
    system_id: SystemId,
    sequence: Arc<AtomicU64>,
    tx: broadcast::Sender<EventEnvelope>,
}

impl LifecyclePublisher {
    pub fn new(system_id: SystemId) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            system_id,
            sequence: Arc::new(AtomicU64::new(0)),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn publish(&self, application_id: ApplicationId, phase: Phase, event: LifecycleEvent) {
        let event_id = EventId::new(self.sequence.fetch_add(1, Ordering::SeqCst) + 1);
        let envelope = match EventEnvelope::builder()
            .event_id(event_id)
            .system_id(self.system_id)
            .application_id(application_id)
            .phase(phase)
            .event(event)
            .build()
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed lifecycle event");
                return;
            }
        };

        trace!(event_type = envelope.event_type(), %event_id, "Publishing lifecycle event");
        // No subscribers is fine.
        let _ = self.tx.send(envelope);
    }
}
