//! Events processed by an application actor.

use plexus_contract::Contract;
use plexus_events::BindingState;
use plexus_id::{Phase, Pointer, SystemId};
use tokio::sync::oneshot;

use crate::container::ResourceSnapshot;
use crate::model::{Assembly, AssemblyPointer, AssemblyState};

/// One unit of work for an application.
///
/// Phase-tagged events are dropped unless their phase matches the
/// application's; the others are processed unconditionally.
#[derive(Debug)]
pub enum AssemblyEvent {
    /// Resolve the whole tree from the root. Master only.
    Configure {
        reply: oneshot::Sender<Option<Assembly>>,
    },
    Setup {
        pointer: Pointer,
        state: AssemblyState,
        reply: oneshot::Sender<AssemblyPointer>,
    },
    Retrieve {
        pointer: Pointer,
        reply: oneshot::Sender<Option<Assembly>>,
    },
    Resolve {
        phase: Phase,
        pointer: Pointer,
        requester: SystemId,
        contract: Contract,
        reuse: bool,
    },
    Release {
        phase: Phase,
        pointer: Pointer,
    },
    Report {
        phase: Phase,
        pointer: Pointer,
        assembly: Option<Assembly>,
    },
    RemoveSystem {
        system: SystemId,
        epoch: Option<Phase>,
    },
    /// Delivery to `system` failed or its lease was lost.
    Unreachable {
        system: SystemId,
    },
    Inspect {
        reply: oneshot::Sender<ApplicationSnapshot>,
    },
    /// Tear the application down.
    Shutdown,
}

impl AssemblyEvent {
    /// Phase the event is bound to, `None` for unconditional events.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Resolve { phase, .. } | Self::Release { phase, .. } | Self::Report { phase, .. } => {
                Some(*phase)
            }
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configure { .. } => "configure",
            Self::Setup { .. } => "setup",
            Self::Retrieve { .. } => "retrieve",
            Self::Resolve { .. } => "resolve",
            Self::Release { .. } => "release",
            Self::Report { .. } => "report",
            Self::RemoveSystem { .. } => "remove_system",
            Self::Unreachable { .. } => "unreachable",
            Self::Inspect { .. } => "inspect",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Point-in-time view of an application, for tests and diagnostics.
#[derive(Debug, Clone)]
pub struct ApplicationSnapshot {
    pub phase: Phase,
    pub master: SystemId,
    pub systems: Vec<SystemId>,
    pub configuring: bool,
    /// Pending requests.
    pub requests: Vec<Pointer>,
    /// Requests that resolved and still hold their reservations.
    pub completed: Vec<Pointer>,
    pub bindings: Vec<(Pointer, BindingState)>,
    /// Free capacity on the host, shared with other applications.
    pub free: ResourceSnapshot,
    /// What this application holds.
    pub held: ResourceSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_protocol_events_are_phase_bound() {
        let pointer = Pointer::root("shop");
        let release = AssemblyEvent::Release {
            phase: Phase::new(4),
            pointer: pointer.clone(),
        };
        assert_eq!(release.phase(), Some(Phase::new(4)));

        let remove = AssemblyEvent::RemoveSystem {
            system: SystemId::new(),
            epoch: Some(Phase::new(9)),
        };
        assert_eq!(remove.phase(), None);
        assert_eq!(AssemblyEvent::Shutdown.phase(), None);
    }
}
