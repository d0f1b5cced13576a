//! Event envelope - the common wrapper for all lifecycle notifications.

use chrono::{DateTime, Utc};
use plexus_id::{ApplicationId, EventId, Phase, SystemId};
use serde::{Deserialize, Serialize};

use crate::{EventError, LifecycleEvent};

/// The event envelope - common metadata for all notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic per emitting host.
    pub event_id: EventId,

    /// When the transition happened.
    pub occurred_at: DateTime<Utc>,

    /// Host whose assembler emitted the event.
    pub system_id: SystemId,

    /// Application under negotiation.
    pub application_id: ApplicationId,

    /// Phase the application was in when the event fired.
    pub phase: Phase,

    /// The notification itself, tagged with its dotted event type.
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

impl EventEnvelope {
    /// Creates a new event envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::new()
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    occurred_at: Option<DateTime<Utc>>,
    system_id: Option<SystemId>,
    application_id: Option<ApplicationId>,
    phase: Phase,
    event: Option<LifecycleEvent>,
}

impl EventEnvelopeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn occurred_at(mut self, ts: DateTime<Utc>) -> Self {
        self.occurred_at = Some(ts);
        self
    }

    pub fn system_id(mut self, system_id: SystemId) -> Self {
        self.system_id = Some(system_id);
        self
    }

    pub fn application_id(mut self, application_id: ApplicationId) -> Self {
        self.application_id = Some(application_id);
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn event(mut self, event: LifecycleEvent) -> Self {
        self.event = Some(event);
        self
    }

    /// Builds the event envelope.
    pub fn build(self) -> Result<EventEnvelope, EventError> {
        Ok(EventEnvelope {
            event_id: self.event_id.ok_or(EventError::MissingField("event_id"))?,
            occurred_at: self.occurred_at.unwrap_or_else(Utc::now),
            system_id: self.system_id.ok_or(EventError::MissingField("system_id"))?,
            application_id: self
                .application_id
                .ok_or(EventError::MissingField("application_id"))?,
            phase: self.phase,
            event: self.event.ok_or(EventError::MissingField("event"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceAddedPayload;

    #[test]
    fn test_event_envelope_builder() {
        let system = SystemId::new();
        let envelope = EventEnvelope::builder()
            .event_id(EventId::new(1))
            .system_id(system)
            .application_id(ApplicationId::new())
            .phase(Phase::new(3))
            .event(LifecycleEvent::DeviceAdded(DeviceAddedPayload { system }))
            .build()
            .unwrap();

        assert_eq!(envelope.event_type(), "device.added");
        assert_eq!(envelope.phase, Phase::new(3));

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["event_type"], "device.added");
        assert_eq!(json["phase"], 3);
    }

    #[test]
    fn test_event_envelope_builder_missing_field() {
        let result = EventEnvelope::builder()
            .event_id(EventId::new(1))
            .system_id(SystemId::new())
            .build();
        assert!(matches!(
            result,
            Err(EventError::MissingField("application_id"))
        ));
    }
}
