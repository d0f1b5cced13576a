//! Data model of a negotiation: requests, candidate instances, bindings and
//! the assemblies they produce.

use std::collections::BTreeMap;

use plexus_contract::Contract;
use plexus_events::BindingState;
use plexus_id::{ContainerId, ElementId, Pointer, ProviderId, SystemId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Assemblies
// =============================================================================

/// Reference from an assembly to one of its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRef {
    pub name: String,
    pub pointer: Pointer,
    /// Host holding the child's assembly.
    pub system_id: SystemId,
}

/// The resolved description of one node of the configuration tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assembly {
    pub system_id: SystemId,
    pub container_id: ContainerId,
    /// Creator for instances, allocator for resources.
    pub creator_id: ProviderId,
    /// Element to reuse. `None` asks the creator for a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<ElementId>,
    pub template: Contract,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<ChildRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ChildRef>,
}

/// A fully expanded assembly tree, gathered across hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyTree {
    pub pointer: Pointer,
    pub assembly: Assembly,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<AssemblyTree>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<AssemblyTree>,
}

impl AssemblyTree {
    /// Number of nodes in the tree, the root included.
    pub fn node_count(&self) -> usize {
        1 + self
            .instances
            .iter()
            .chain(self.resources.iter())
            .map(AssemblyTree::node_count)
            .sum::<usize>()
    }

    /// Finds the node at `pointer`.
    pub fn find(&self, pointer: &Pointer) -> Option<&AssemblyTree> {
        if &self.pointer == pointer {
            return Some(self);
        }
        self.instances
            .iter()
            .chain(self.resources.iter())
            .find_map(|child| child.find(pointer))
    }
}

/// A reserved resource and the reservations made for its own resource
/// demands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub pointer: Pointer,
    pub assembly: Assembly,
    pub children: Vec<Reservation>,
}

impl Reservation {
    pub fn child_ref(&self) -> ChildRef {
        ChildRef {
            name: self.assembly.name.clone(),
            pointer: self.pointer.clone(),
            system_id: self.assembly.system_id,
        }
    }
}

// =============================================================================
// Persisted state hints
// =============================================================================

/// What a node was assembled from last time, used as a reuse hint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<ProviderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<ElementId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<Contract>,
    /// Host that provided each instance child, by child name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, SystemId>,
}

/// Answer to `setup`: where the children of a node were last placed, so the
/// caller can continue seeding hints on those hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyPointer {
    pub pointer: Pointer,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<ChildRef>,
}

impl AssemblyPointer {
    pub fn from_state(pointer: Pointer, state: &AssemblyState) -> Self {
        let instances = state
            .children
            .iter()
            .map(|(name, system_id)| ChildRef {
                name: name.clone(),
                pointer: pointer.instance(name.clone()),
                system_id: *system_id,
            })
            .collect();
        Self { pointer, instances }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Tracks resolution of one child demand of a candidate instance.
#[derive(Debug, Clone)]
pub struct InstanceBinding {
    pub name: String,
    pub pointer: Pointer,
    /// Remaining hosts to ask, current one first.
    pub systems: Vec<SystemId>,
    pub state: BindingState,
    pub contract: Contract,
    pub assembly: Option<Assembly>,
}

impl InstanceBinding {
    pub fn new(pointer: Pointer, systems: Vec<SystemId>, contract: Contract) -> Self {
        Self {
            name: contract.name.clone(),
            pointer,
            systems,
            state: BindingState::Resolving,
            contract,
            assembly: None,
        }
    }

    /// Host currently asked to resolve the child.
    pub fn current(&self) -> Option<SystemId> {
        self.systems.first().copied()
    }

    /// Moves to `next` if the transition is allowed.
    pub fn advance(&mut self, next: BindingState) -> bool {
        if self.state.can_become(next) {
            self.state = next;
            true
        } else {
            false
        }
    }
}

/// One (creator, remaining templates) candidate for a request.
#[derive(Debug, Clone)]
pub struct Instance {
    pub creator_id: ProviderId,
    /// Remaining templates to try, current one first.
    pub templates: Vec<Contract>,
    /// Whether this candidate is the creator recorded in the reuse hint.
    pub reuse: bool,
    pub element_id: Option<ElementId>,
    pub bindings: BTreeMap<String, InstanceBinding>,
    pub resources: BTreeMap<String, Reservation>,
}

impl Instance {
    pub fn new(creator_id: ProviderId, templates: Vec<Contract>) -> Self {
        Self {
            creator_id,
            templates,
            reuse: false,
            element_id: None,
            bindings: BTreeMap::new(),
            resources: BTreeMap::new(),
        }
    }

    pub fn template(&self) -> Option<&Contract> {
        self.templates.first()
    }

    pub fn all_resolved(&self) -> bool {
        self.bindings
            .values()
            .all(|b| b.state == BindingState::Resolved)
    }
}

/// A pending resolution of one pointer on this host.
#[derive(Debug, Clone)]
pub struct InstanceRequest {
    pub pointer: Pointer,
    pub requesting_system: SystemId,
    pub contract: Contract,
    /// Cleared when the request is being released.
    pub required: bool,
    /// Remaining candidates, current one first.
    pub instances: Vec<Instance>,
}

impl InstanceRequest {
    pub fn new(
        pointer: Pointer,
        requesting_system: SystemId,
        contract: Contract,
        instances: Vec<Instance>,
    ) -> Self {
        Self {
            pointer,
            requesting_system,
            contract,
            required: true,
            instances,
        }
    }

    pub fn current(&self) -> Option<&Instance> {
        self.instances.first()
    }

    pub fn current_mut(&mut self) -> Option<&mut Instance> {
        self.instances.first_mut()
    }
}
