//! Resolving requests: candidate selection, resource reservation and child
//! fan-out.

use std::collections::BTreeMap;

use plexus_contract::Contract;
use plexus_events::{LifecycleEvent, RequestAddedPayload, RequestRemovedPayload};
use plexus_id::{Pointer, SystemId};
use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use crate::model::{
    Assembly, AssemblyState, ChildRef, Instance, InstanceBinding, InstanceRequest, Reservation,
};

use super::{Application, Outbound};

impl Application {
    /// Starts resolving `pointer` on behalf of `requester`.
    pub(super) fn resolve_request(
        &mut self,
        pointer: Pointer,
        requester: SystemId,
        contract: Contract,
        reuse: bool,
    ) {
        if self.requests.contains_key(&pointer) || self.completed.contains_key(&pointer) {
            debug!(app = %self.id, %pointer, "Duplicate resolve ignored");
            return;
        }

        let instances = if pointer.is_root() {
            self.root_candidates(&pointer)
        } else {
            self.candidates(&pointer, &contract, reuse)
        };

        debug!(
            app = %self.id,
            %pointer,
            requester = %requester,
            candidates = instances.len(),
            "Resolving"
        );
        self.publish(LifecycleEvent::RequestAdded(RequestAddedPayload {
            pointer: pointer.clone(),
            requesting_system: requester,
            demand: contract.name.clone(),
            candidates: instances.len(),
        }));

        self.requests.insert(
            pointer.clone(),
            InstanceRequest::new(pointer.clone(), requester, contract, instances),
        );
        self.try_candidates(&pointer);
    }

    /// The root is only ever rebuilt from its recorded state.
    fn root_candidates(&self, pointer: &Pointer) -> Vec<Instance> {
        match self.states.get(pointer) {
            Some(AssemblyState {
                creator_id: Some(creator_id),
                element_id,
                templates,
                ..
            }) if !templates.is_empty() => {
                let mut instance = Instance::new(*creator_id, templates.clone());
                instance.reuse = true;
                instance.element_id = *element_id;
                vec![instance]
            }
            _ => {
                warn!(app = %self.id, %pointer, "Root has no recorded creator or templates");
                Vec::new()
            }
        }
    }

    /// Candidates from the container, the recorded creator first when the
    /// parent was itself reused.
    fn candidates(&self, pointer: &Pointer, demand: &Contract, reuse: bool) -> Vec<Instance> {
        let mut found = match self.container.get_templates(std::slice::from_ref(demand)) {
            Ok(mut found) => found.remove(demand).unwrap_or_default(),
            Err(e) => {
                warn!(app = %self.id, %pointer, error = %e, "Template lookup failed");
                Vec::new()
            }
        };

        let hint = self.states.get(pointer);
        let preferred = if reuse {
            hint.and_then(|state| state.creator_id)
        } else {
            None
        };
        // Stable: the rest keep container order.
        found.sort_by_key(|c| Some(c.provider_id) != preferred);

        found
            .into_iter()
            .map(|candidate| {
                let reused = Some(candidate.provider_id) == preferred;
                let mut instance = Instance::new(candidate.provider_id, candidate.templates);
                if reused {
                    instance.reuse = true;
                    instance.element_id = hint.and_then(|state| state.element_id);
                }
                instance
            })
            .collect()
    }

    /// Walks candidates and templates until one has its resources reserved
    /// and its child resolves sent, or every candidate is exhausted.
    pub(super) fn try_candidates(&mut self, pointer: &Pointer) {
        loop {
            let Some(request) = self.requests.get_mut(pointer) else {
                return;
            };
            let Some(instance) = request.instances.first() else {
                self.fail_request(pointer);
                return;
            };
            let Some(template) = instance.template().cloned() else {
                request.instances.remove(0);
                self.publish_request_changed(pointer);
                continue;
            };
            let reuse = instance.reuse;

            let Some(reservations) = self.reserve_resources(pointer, &template, reuse) else {
                debug!(app = %self.id, %pointer, template = %template, "Template resources unavailable");
                self.drop_template(pointer);
                continue;
            };

            let mut bindings = BTreeMap::new();
            for demand in template.instance_demands() {
                let child = pointer.instance(demand.name.clone());
                let hosts = self.binding_hosts(pointer, &demand.name, reuse);
                bindings.insert(
                    demand.name.clone(),
                    InstanceBinding::new(child, hosts, demand.clone()),
                );
            }

            if bindings.values().any(|b| b.systems.is_empty()) {
                warn!(app = %self.id, %pointer, "No participants left to host children");
                for reservation in reservations.values() {
                    self.resources.release_tree(self.id, reservation);
                }
                self.drop_template(pointer);
                continue;
            }

            // The reuse flag sent down says whether the child stays where the
            // hint placed it.
            let sends: Vec<(SystemId, Pointer, Contract, bool)> = bindings
                .values()
                .filter_map(|b| {
                    let host = b.current()?;
                    let pinned = reuse && self.previous_host(pointer, &b.name) == Some(host);
                    Some((host, b.pointer.clone(), b.contract.clone(), pinned))
                })
                .collect();
            for binding in bindings.values() {
                self.publish_binding(binding);
            }

            let Some(instance) = self.current_instance_mut(pointer) else {
                return;
            };
            instance.resources = reservations;
            instance.bindings = bindings;

            if sends.is_empty() {
                self.complete_request(pointer);
                return;
            }

            for (host, child, contract, pinned) in sends {
                self.send_resolve(host, child, contract, pinned);
            }
            return;
        }
    }

    /// Discards the current template of the current candidate.
    pub(super) fn drop_template(&mut self, pointer: &Pointer) {
        if let Some(instance) = self.current_instance_mut(pointer) {
            if !instance.templates.is_empty() {
                instance.templates.remove(0);
            }
            instance.bindings.clear();
        }
        self.publish_request_changed(pointer);
    }

    fn previous_host(&self, parent: &Pointer, name: &str) -> Option<SystemId> {
        self.states
            .get(parent)
            .and_then(|state| state.children.get(name).copied())
    }

    /// Hosts to try for a child, in order. The host recorded for the child
    /// goes first when the parent is reused; the rest are shuffled.
    fn binding_hosts(&mut self, parent: &Pointer, name: &str, reuse: bool) -> Vec<SystemId> {
        let mut hosts = self.systems.clone();
        hosts.shuffle(&mut self.rng);

        let previous = if reuse {
            self.previous_host(parent, name)
        } else {
            None
        };
        if let Some(index) = previous.and_then(|p| hosts.iter().position(|h| *h == p)) {
            let host = hosts.remove(index);
            hosts.insert(0, host);
        }
        hosts
    }

    pub(super) fn send_resolve(&mut self, to: SystemId, pointer: Pointer, contract: Contract, reuse: bool) {
        trace!(app = %self.id, %pointer, to = %to, reuse, "Sending resolve");
        let message = Outbound::Resolve {
            phase: self.phase,
            pointer,
            requester: self.system,
            contract,
            reuse,
        };
        self.send(to, message);
    }

    pub(super) fn send_report(&mut self, to: SystemId, pointer: Pointer, assembly: Option<Assembly>) {
        trace!(app = %self.id, %pointer, to = %to, resolved = assembly.is_some(), "Sending report");
        let message = Outbound::Report {
            phase: self.phase,
            pointer,
            assembly,
        };
        self.send(to, message);
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Reserves every resource demand of `template`, or nothing.
    fn reserve_resources(
        &mut self,
        pointer: &Pointer,
        template: &Contract,
        reuse: bool,
    ) -> Option<BTreeMap<String, Reservation>> {
        let mut reserved: BTreeMap<String, Reservation> = BTreeMap::new();
        for demand in template.resource_demands() {
            let child = pointer.resource(demand.name.clone());
            match self.resolve_resource(&child, demand, reuse) {
                Some(reservation) => {
                    reserved.insert(demand.name.clone(), reservation);
                }
                None => {
                    for reservation in reserved.values() {
                        self.resources.release_tree(self.id, reservation);
                    }
                    return None;
                }
            }
        }
        Some(reserved)
    }

    /// Reserves one resource demand and, recursively, the demands of the
    /// chosen resource template.
    fn resolve_resource(
        &mut self,
        pointer: &Pointer,
        demand: &Contract,
        reuse: bool,
    ) -> Option<Reservation> {
        let mut candidates = match self.container.get_templates(std::slice::from_ref(demand)) {
            Ok(mut found) => found.remove(demand).unwrap_or_default(),
            Err(e) => {
                warn!(app = %self.id, %pointer, error = %e, "Allocator lookup failed");
                return None;
            }
        };

        let hint = self.states.get(pointer).cloned().unwrap_or_default();
        let preferred = if reuse { hint.creator_id } else { None };
        candidates.sort_by_key(|c| Some(c.provider_id) != preferred);

        for candidate in candidates {
            let reused = Some(candidate.provider_id) == preferred;
            for template in candidate.templates {
                if let Err(e) =
                    self.resources
                        .reserve(self.id, candidate.provider_id, &template.estimate)
                {
                    trace!(%pointer, allocator = %candidate.provider_id, error = %e, "Reservation refused");
                    continue;
                }

                let mut children: Vec<Reservation> = Vec::new();
                let mut complete = true;
                for sub in template.resource_demands() {
                    match self.resolve_resource(&pointer.resource(sub.name.clone()), sub, reused) {
                        Some(child) => children.push(child),
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }

                if complete {
                    let assembly = Assembly {
                        system_id: self.system,
                        container_id: self.container.container_id(),
                        creator_id: candidate.provider_id,
                        element_id: if reused { hint.element_id } else { None },
                        name: demand.name.clone(),
                        instances: Vec::new(),
                        resources: children.iter().map(Reservation::child_ref).collect(),
                        template,
                    };
                    return Some(Reservation {
                        pointer: pointer.clone(),
                        assembly,
                        children,
                    });
                }

                for child in &children {
                    self.resources.release_tree(self.id, child);
                }
                if let Err(e) =
                    self.resources
                        .release(self.id, candidate.provider_id, &template.estimate)
                {
                    warn!(%pointer, error = %e, "Failed to roll back reservation");
                }
            }
        }

        None
    }

    // =========================================================================
    // Outcomes
    // =========================================================================

    /// Records the current candidate as the result and reports it upward.
    pub(super) fn complete_request(&mut self, pointer: &Pointer) {
        let Some(request) = self.requests.remove(pointer) else {
            return;
        };
        let Some(assembly) = request
            .current()
            .and_then(|instance| self.assemble(pointer, instance))
        else {
            warn!(app = %self.id, %pointer, "Completed request has no usable candidate");
            self.requests.insert(pointer.clone(), request);
            return;
        };

        if let Some(instance) = request.current() {
            for reservation in instance.resources.values() {
                self.record_reservation(reservation);
            }
            self.states
                .insert(pointer.clone(), hint_from(&assembly, instance));
        }
        self.assemblies.insert(pointer.clone(), assembly.clone());

        debug!(app = %self.id, %pointer, creator = %assembly.creator_id, "Resolved");
        self.publish(LifecycleEvent::RequestRemoved(RequestRemovedPayload {
            pointer: pointer.clone(),
            resolved: true,
        }));

        let requester = request.requesting_system;
        self.completed.insert(pointer.clone(), request);
        self.send_report(requester, pointer.clone(), Some(assembly));
    }

    /// Drops the request and reports failure upward.
    pub(super) fn fail_request(&mut self, pointer: &Pointer) {
        let Some(mut request) = self.requests.remove(pointer) else {
            return;
        };
        for instance in &mut request.instances {
            for reservation in std::mem::take(&mut instance.resources).values() {
                self.resources.release_tree(self.id, reservation);
            }
        }

        debug!(app = %self.id, %pointer, "Resolution failed");
        self.publish(LifecycleEvent::RequestRemoved(RequestRemovedPayload {
            pointer: pointer.clone(),
            resolved: false,
        }));
        self.send_report(request.requesting_system, pointer.clone(), None);
    }

    fn assemble(&self, pointer: &Pointer, instance: &Instance) -> Option<Assembly> {
        let template = instance.template()?.clone();
        let instances = instance
            .bindings
            .values()
            .map(|binding| {
                let system_id = binding
                    .assembly
                    .as_ref()
                    .map(|a| a.system_id)
                    .or_else(|| binding.current())?;
                Some(ChildRef {
                    name: binding.name.clone(),
                    pointer: binding.pointer.clone(),
                    system_id,
                })
            })
            .collect::<Option<Vec<_>>>()?;

        Some(Assembly {
            system_id: self.system,
            container_id: self.container.container_id(),
            creator_id: instance.creator_id,
            element_id: instance.element_id,
            name: pointer
                .last()
                .map(|segment| segment.name.clone())
                .unwrap_or_default(),
            instances,
            resources: instance
                .resources
                .values()
                .map(Reservation::child_ref)
                .collect(),
            template,
        })
    }

    fn record_reservation(&mut self, reservation: &Reservation) {
        let mut work = vec![reservation];
        while let Some(node) = work.pop() {
            self.assemblies
                .insert(node.pointer.clone(), node.assembly.clone());
            work.extend(node.children.iter());
        }
    }

    /// Forgets the assemblies recorded for a completed request.
    pub(super) fn forget_assemblies(&mut self, pointer: &Pointer, instance: Option<&Instance>) {
        self.assemblies.remove(pointer);
        let Some(instance) = instance else {
            return;
        };
        let mut work: Vec<&Reservation> = instance.resources.values().collect();
        while let Some(node) = work.pop() {
            self.assemblies.remove(&node.pointer);
            work.extend(node.children.iter());
        }
    }
}

/// Reuse hint describing a freshly resolved node, so the next configuration
/// of the same application prefers the same placement.
fn hint_from(assembly: &Assembly, instance: &Instance) -> AssemblyState {
    AssemblyState {
        creator_id: Some(assembly.creator_id),
        element_id: assembly.element_id,
        templates: instance.templates.clone(),
        children: assembly
            .instances
            .iter()
            .map(|child| (child.name.clone(), child.system_id))
            .collect(),
    }
}
