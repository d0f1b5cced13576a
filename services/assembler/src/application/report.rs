//! Child reports, releases and back-off.

use plexus_events::BindingState;
use plexus_id::{Pointer, SystemId};
use tracing::{debug, warn};

use crate::model::{Assembly, Instance, InstanceBinding};

use super::{Application, Outbound};

/// What a child report does to its binding.
enum Outcome {
    Resolved,
    Ignore(&'static str),
    /// A child reported failure for a binding already marked resolved.
    Contradicted,
    Drop,
    Retry(SystemId),
    Exhausted,
}

impl Application {
    /// Applies a child's report to the binding waiting for it.
    pub(super) fn report_instance(&mut self, pointer: &Pointer, assembly: Option<Assembly>) {
        let parent = pointer.parent();
        if parent.is_empty() {
            self.finish_configure(assembly);
            return;
        }

        let Some(name) = pointer.last().map(|segment| segment.name.clone()) else {
            return;
        };
        let Some(request) = self.requests.get_mut(&parent) else {
            debug!(app = %self.id, %pointer, "Report for unknown request");
            return;
        };
        let required = request.required;
        let Some(binding) = request
            .current_mut()
            .and_then(|instance| instance.bindings.get_mut(&name))
        else {
            debug!(app = %self.id, %pointer, "Report for unknown binding");
            return;
        };

        let outcome = match (assembly.is_some(), binding.state) {
            (true, BindingState::Resolving) => {
                binding.advance(BindingState::Resolved);
                binding.assembly = assembly;
                Outcome::Resolved
            }
            (true, BindingState::Resolved) => Outcome::Ignore("duplicate success"),
            // The release was queued behind the resolve; the child answers it
            // with a failure report later.
            (true, BindingState::Releasing) => Outcome::Ignore("success while releasing"),
            (false, BindingState::Releasing) => Outcome::Drop,
            (false, _) if !required => Outcome::Drop,
            (false, BindingState::Resolved) => Outcome::Contradicted,
            (false, BindingState::Resolving) => {
                if !binding.systems.is_empty() {
                    binding.systems.remove(0);
                }
                match binding.current() {
                    Some(next) => Outcome::Retry(next),
                    None => Outcome::Exhausted,
                }
            }
        };

        match outcome {
            Outcome::Resolved => {
                if let Some(binding) = self.binding(&parent, &name) {
                    self.publish_binding(binding);
                }
                let done = self
                    .current_instance(&parent)
                    .is_some_and(Instance::all_resolved);
                if done && required {
                    self.complete_request(&parent);
                }
            }
            Outcome::Ignore(reason) => {
                debug!(app = %self.id, %pointer, reason, "Report ignored");
            }
            Outcome::Contradicted => {
                warn!(app = %self.id, %pointer, "Failure reported for a resolved child; ignoring");
            }
            Outcome::Drop => self.drop_binding(&parent, &name),
            Outcome::Retry(next) => {
                let Some(binding) = self.binding(&parent, &name) else {
                    return;
                };
                let contract = binding.contract.clone();
                self.publish_binding(binding);
                debug!(app = %self.id, %pointer, next = %next, "Child failed; trying next host");
                self.send_resolve(next, pointer.clone(), contract, false);
            }
            Outcome::Exhausted => {
                debug!(app = %self.id, %pointer, "No host could resolve child; backing off");
                if let Some(instance) = self.current_instance_mut(&parent) {
                    instance.bindings.remove(&name);
                }
                self.back_off(&parent);
            }
        }
    }

    /// Releases a request: its reservations are returned at once, its child
    /// bindings are released, and failure is reported upward once all of
    /// them have answered.
    pub(super) fn release_request(&mut self, pointer: &Pointer) {
        if let Some(request) = self.completed.remove(pointer) {
            self.forget_assemblies(pointer, request.current());
            self.requests.insert(pointer.clone(), request);
        }

        let Some(request) = self.requests.get_mut(pointer) else {
            debug!(app = %self.id, %pointer, "Release for unknown request");
            return;
        };
        if !request.required {
            debug!(app = %self.id, %pointer, "Request already releasing");
            return;
        }

        request.required = false;
        let reservations = request
            .current_mut()
            .map(|instance| std::mem::take(&mut instance.resources))
            .unwrap_or_default();
        for reservation in reservations.values() {
            self.resources.release_tree(self.id, reservation);
        }

        debug!(app = %self.id, %pointer, "Releasing");
        self.publish_request_changed(pointer);
        self.back_off(pointer);
    }

    /// Moves every binding that is not yet releasing to releasing and sends
    /// the releases. Completes immediately when nothing is left to wait for.
    pub(super) fn back_off(&mut self, pointer: &Pointer) {
        let Some(instance) = self.current_instance_mut(pointer) else {
            self.bindings_drained(pointer);
            return;
        };

        let mut releases = Vec::new();
        for binding in instance.bindings.values_mut() {
            if binding.advance(BindingState::Releasing) {
                if let Some(host) = binding.current() {
                    releases.push((host, binding.pointer.clone()));
                }
            }
        }
        let empty = instance.bindings.is_empty();

        for (host, child) in releases {
            if let Some(binding) = self
                .current_instance(pointer)
                .and_then(|i| i.bindings.values().find(|b| b.pointer == child))
            {
                self.publish_binding(binding);
            }
            let message = Outbound::Release {
                phase: self.phase,
                pointer: child,
            };
            self.send(host, message);
        }

        if empty {
            self.bindings_drained(pointer);
        }
    }

    fn drop_binding(&mut self, parent: &Pointer, name: &str) {
        let Some(instance) = self.current_instance_mut(parent) else {
            return;
        };
        instance.bindings.remove(name);
        if instance.bindings.is_empty() {
            self.bindings_drained(parent);
        }
    }

    /// Every child of the current candidate has answered its release. A
    /// released request reports failure upward; a request backing off moves
    /// on to its next template.
    fn bindings_drained(&mut self, pointer: &Pointer) {
        let Some(request) = self.requests.get_mut(pointer) else {
            return;
        };
        if !request.required {
            self.fail_request(pointer);
            return;
        }

        let reservations = request
            .current_mut()
            .map(|instance| std::mem::take(&mut instance.resources))
            .unwrap_or_default();
        for reservation in reservations.values() {
            self.resources.release_tree(self.id, reservation);
        }

        self.drop_template(pointer);
        self.try_candidates(pointer);
    }

    fn binding(&self, parent: &Pointer, name: &str) -> Option<&InstanceBinding> {
        self.current_instance(parent)
            .and_then(|instance| instance.bindings.get(name))
    }
}
