//! Lifecycle event payloads.

use plexus_id::{ElementId, Phase, Pointer, ProviderId, SystemId};
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const STATE_ADDED: &str = "state.added";

    pub const REQUEST_ADDED: &str = "request.added";
    pub const REQUEST_CHANGED: &str = "request.changed";
    pub const REQUEST_REMOVED: &str = "request.removed";

    pub const BINDING_CHANGED: &str = "binding.changed";

    pub const DEVICE_ADDED: &str = "device.added";
    pub const DEVICE_REMOVED: &str = "device.removed";

    pub const ALL: [&str; 7] = [
        STATE_ADDED,
        REQUEST_ADDED,
        REQUEST_CHANGED,
        REQUEST_REMOVED,
        BINDING_CHANGED,
        DEVICE_ADDED,
        DEVICE_REMOVED,
    ];
}

// =============================================================================
// Binding State
// =============================================================================

/// State of one child binding of a candidate instance.
///
/// Transitions only go forward: resolving to resolved, and resolving or
/// resolved to releasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingState {
    Resolving,
    Resolved,
    Releasing,
}

impl BindingState {
    /// Returns true if moving from `self` to `next` is allowed.
    pub fn can_become(&self, next: BindingState) -> bool {
        matches!(
            (self, next),
            (Self::Resolving, Self::Resolved)
                | (Self::Resolving, Self::Releasing)
                | (Self::Resolved, Self::Releasing)
        )
    }
}

impl std::fmt::Display for BindingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Resolving => "resolving",
            Self::Resolved => "resolved",
            Self::Releasing => "releasing",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateAddedPayload {
    pub pointer: Pointer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<ProviderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element_id: Option<ElementId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAddedPayload {
    pub pointer: Pointer,
    pub requesting_system: SystemId,
    pub demand: String,
    pub candidates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestChangedPayload {
    pub pointer: Pointer,
    /// Creator now being tried, if any candidate is left.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<ProviderId>,
    /// Name of the template now being tried.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    pub candidates: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRemovedPayload {
    pub pointer: Pointer,
    /// True when the request left because it resolved successfully.
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingChangedPayload {
    /// Pointer of the child the binding resolves.
    pub pointer: Pointer,
    pub state: BindingState,
    /// Host currently asked to resolve the child.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAddedPayload {
    pub system: SystemId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRemovedPayload {
    pub system: SystemId,
    /// Phase entered because of the removal.
    pub phase: Phase,
}

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum LifecycleEvent {
    #[serde(rename = "state.added")]
    StateAdded(StateAddedPayload),
    #[serde(rename = "request.added")]
    RequestAdded(RequestAddedPayload),
    #[serde(rename = "request.changed")]
    RequestChanged(RequestChangedPayload),
    #[serde(rename = "request.removed")]
    RequestRemoved(RequestRemovedPayload),
    #[serde(rename = "binding.changed")]
    BindingChanged(BindingChangedPayload),
    #[serde(rename = "device.added")]
    DeviceAdded(DeviceAddedPayload),
    #[serde(rename = "device.removed")]
    DeviceRemoved(DeviceRemovedPayload),
}

impl LifecycleEvent {
    /// The dotted event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StateAdded(_) => event_types::STATE_ADDED,
            Self::RequestAdded(_) => event_types::REQUEST_ADDED,
            Self::RequestChanged(_) => event_types::REQUEST_CHANGED,
            Self::RequestRemoved(_) => event_types::REQUEST_REMOVED,
            Self::BindingChanged(_) => event_types::BINDING_CHANGED,
            Self::DeviceAdded(_) => event_types::DEVICE_ADDED,
            Self::DeviceRemoved(_) => event_types::DEVICE_REMOVED,
        }
    }

    /// Decodes an event from its type name and JSON payload.
    pub fn from_parts(event_type: &str, payload: serde_json::Value) -> Result<Self, EventError> {
        if !event_types::ALL.contains(&event_type) {
            return Err(EventError::UnknownEventType(event_type.to_string()));
        }
        let tagged = serde_json::json!({ "event_type": event_type, "payload": payload });
        Ok(serde_json::from_value(tagged)?)
    }
}
