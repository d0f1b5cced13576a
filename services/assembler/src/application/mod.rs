//! Per-application negotiation actor.
//!
//! Every host taking part in an application runs one [`Application`] actor
//! for it. The actor owns all negotiation state for that application on the
//! host: the pending and completed requests, the reuse hints and the
//! participant list. Resources come from the host's shared
//! [`ResourceMonitor`], which tracks what each application holds. Events are handled one at
//! a time in arrival order, so none of that state needs locking.
//!
//! One participant is the master. It drives root resolution and is the
//! authority on the application's phase: slaves adopt a newer phase when an
//! event carries one, the master drops anything not tagged with its own.

mod event;
mod membership;
mod outbox;
mod report;
mod resolve;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use plexus_contract::Contract;
use plexus_events::{
    BindingChangedPayload, DeviceAddedPayload, LifecycleEvent, RequestChangedPayload,
    RequestRemovedPayload, StateAddedPayload,
};
use plexus_id::{ApplicationId, LeaseId, Phase, Pointer, SystemId};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::actors::{Actor, ActorContext, ActorError, ActorHandle};
use crate::container::Container;
use crate::lease::LivenessPort;
use crate::lifecycle::LifecyclePublisher;
use crate::model::{
    Assembly, AssemblyPointer, AssemblyState, Instance, InstanceBinding, InstanceRequest,
};
use crate::peer::PeerDirectory;
use crate::resources::ResourceMonitor;

pub use event::{ApplicationSnapshot, AssemblyEvent};
pub use outbox::{Outbound, Outbox};

/// Host-wide collaborators shared by every application on the host.
#[derive(Clone)]
pub struct HostContext {
    pub system_id: SystemId,
    pub container: Arc<dyn Container>,
    pub directory: Arc<dyn PeerDirectory>,
    pub leases: Arc<dyn LivenessPort>,
    pub lifecycle: LifecyclePublisher,
    pub resources: Arc<ResourceMonitor>,
    pub binding_seed: Option<u64>,
}

/// Negotiation state of one application on one host.
pub struct Application {
    id: ApplicationId,
    name: String,
    system: SystemId,
    master: SystemId,
    systems: Vec<SystemId>,
    phase: Phase,

    container: Arc<dyn Container>,
    leases: Arc<dyn LivenessPort>,
    lifecycle: LifecyclePublisher,
    outbox: Outbox,

    resources: Arc<ResourceMonitor>,

    states: HashMap<Pointer, AssemblyState>,
    root: Option<Pointer>,
    requests: HashMap<Pointer, InstanceRequest>,
    completed: HashMap<Pointer, InstanceRequest>,
    assemblies: HashMap<Pointer, Assembly>,

    configuring: bool,
    waiters: Vec<oneshot::Sender<Option<Assembly>>>,

    /// Slave leases the master keeps alive, by slave.
    hooked: HashMap<SystemId, LeaseId>,

    rng: StdRng,
}

impl Application {
    /// Creates the actor state. `handle` must address the mailbox the actor
    /// will be spawned on.
    pub fn new(
        id: ApplicationId,
        master: SystemId,
        systems: Vec<SystemId>,
        host: HostContext,
        handle: ActorHandle<AssemblyEvent>,
    ) -> Self {
        let rng = match host.binding_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut participants = Vec::with_capacity(systems.len() + 1);
        for system in systems.into_iter().chain([host.system_id, master]) {
            if !participants.contains(&system) {
                participants.push(system);
            }
        }

        Self {
            name: format!("application-{}", id),
            id,
            system: host.system_id,
            master,
            systems: participants,
            phase: Phase::INITIAL,
            container: host.container,
            leases: host.leases,
            lifecycle: host.lifecycle,
            outbox: Outbox::new(id, host.directory, handle),
            resources: host.resources,
            states: HashMap::new(),
            root: None,
            requests: HashMap::new(),
            completed: HashMap::new(),
            assemblies: HashMap::new(),
            configuring: false,
            waiters: Vec::new(),
            hooked: HashMap::new(),
            rng,
        }
    }

    /// Slave leases this master keeps alive.
    #[must_use]
    pub fn with_hooked(mut self, hooked: HashMap<SystemId, LeaseId>) -> Self {
        self.hooked = hooked;
        self
    }

    pub fn is_master(&self) -> bool {
        self.system == self.master
    }

    /// Whether an event tagged with `phase` may be performed, adopting a
    /// newer phase on slaves.
    fn admit(&mut self, phase: Phase) -> bool {
        if phase == self.phase {
            return true;
        }
        if phase > self.phase && !self.is_master() {
            self.enter_phase(phase);
            return true;
        }
        false
    }

    /// Switches to `phase`, abandoning everything negotiated so far.
    fn enter_phase(&mut self, phase: Phase) {
        let abandoned: Vec<Pointer> = self.requests.keys().cloned().collect();
        for pointer in abandoned {
            self.publish(LifecycleEvent::RequestRemoved(RequestRemovedPayload {
                pointer,
                resolved: false,
            }));
        }

        debug!(app = %self.id, from = %self.phase, to = %phase, "Entering phase");
        self.phase = phase;
        self.requests.clear();
        self.completed.clear();
        self.assemblies.clear();
        self.resources.release_all(self.id);
    }

    fn publish(&self, event: LifecycleEvent) {
        self.lifecycle.publish(self.id, self.phase, event);
    }

    fn publish_request_changed(&self, pointer: &Pointer) {
        let Some(request) = self.requests.get(pointer) else {
            return;
        };
        let current = request.current();
        self.publish(LifecycleEvent::RequestChanged(RequestChangedPayload {
            pointer: pointer.clone(),
            creator_id: current.map(|i| i.creator_id),
            template: current
                .and_then(Instance::template)
                .map(|t| t.name.clone()),
            candidates: request.instances.len(),
        }));
    }

    fn publish_binding(&self, binding: &InstanceBinding) {
        self.publish(LifecycleEvent::BindingChanged(BindingChangedPayload {
            pointer: binding.pointer.clone(),
            state: binding.state,
            system: binding.current(),
        }));
    }

    fn current_instance(&self, pointer: &Pointer) -> Option<&Instance> {
        self.requests.get(pointer).and_then(InstanceRequest::current)
    }

    fn current_instance_mut(&mut self, pointer: &Pointer) -> Option<&mut Instance> {
        self.requests
            .get_mut(pointer)
            .and_then(InstanceRequest::current_mut)
    }

    fn send(&mut self, to: SystemId, message: Outbound) {
        self.outbox.send(to, message);
    }

    fn setup(&mut self, pointer: Pointer, state: AssemblyState) -> AssemblyPointer {
        self.publish(LifecycleEvent::StateAdded(StateAddedPayload {
            pointer: pointer.clone(),
            creator_id: state.creator_id,
            element_id: state.element_id,
        }));

        if pointer.is_root() {
            self.root = Some(pointer.clone());
        }

        let answer = AssemblyPointer::from_state(pointer.clone(), &state);
        self.states.insert(pointer, state);
        answer
    }

    fn configure(&mut self, reply: oneshot::Sender<Option<Assembly>>) {
        if !self.is_master() {
            warn!(app = %self.id, "Configure sent to a slave");
            let _ = reply.send(None);
            return;
        }

        self.waiters.push(reply);
        if self.configuring {
            debug!(app = %self.id, "Joining configuration in flight");
            return;
        }

        self.configuring = true;
        self.restart_root();
    }

    /// Starts a fresh root resolve in a new phase.
    fn restart_root(&mut self) {
        let Some(root) = self.root.clone() else {
            warn!(app = %self.id, "No root state; nothing to configure");
            self.finish_configure(None);
            return;
        };

        self.enter_phase(self.phase.next());
        info!(app = %self.id, phase = %self.phase, root = %root, "Resolving root");

        let name = root
            .last()
            .map(|segment| segment.name.clone())
            .unwrap_or_default();
        self.resolve_request(
            root,
            self.system,
            Contract::instance_demand(name),
            true,
        );
    }

    fn finish_configure(&mut self, assembly: Option<Assembly>) {
        if !self.configuring {
            debug!(app = %self.id, "Root report without a configuration in flight");
            return;
        }

        self.configuring = false;
        info!(
            app = %self.id,
            phase = %self.phase,
            resolved = assembly.is_some(),
            waiters = self.waiters.len(),
            "Configuration finished"
        );
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(assembly.clone());
        }
    }

    fn snapshot(&self) -> ApplicationSnapshot {
        let mut requests: Vec<Pointer> = self.requests.keys().cloned().collect();
        requests.sort();
        let mut completed: Vec<Pointer> = self.completed.keys().cloned().collect();
        completed.sort();
        let mut bindings: Vec<_> = self
            .requests
            .values()
            .chain(self.completed.values())
            .filter_map(InstanceRequest::current)
            .flat_map(|i| i.bindings.values())
            .map(|b| (b.pointer.clone(), b.state))
            .collect();
        bindings.sort_by(|a, b| a.0.cmp(&b.0));

        ApplicationSnapshot {
            phase: self.phase,
            master: self.master,
            systems: self.systems.clone(),
            configuring: self.configuring,
            requests,
            completed,
            bindings,
            free: self.resources.current(),
            held: self.resources.held(self.id),
        }
    }
}

#[async_trait]
impl Actor for Application {
    type Message = AssemblyEvent;

    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        info!(
            app = %self.id,
            master = %self.master,
            participants = self.systems.len(),
            "Application started"
        );
        for system in self.systems.clone() {
            self.publish(LifecycleEvent::DeviceAdded(DeviceAddedPayload { system }));
        }
        Ok(())
    }

    async fn handle(
        &mut self,
        msg: AssemblyEvent,
        _ctx: &mut ActorContext,
    ) -> Result<bool, ActorError> {
        if let Some(phase) = msg.phase() {
            if !self.admit(phase) {
                debug!(
                    app = %self.id,
                    kind = msg.kind(),
                    event_phase = %phase,
                    phase = %self.phase,
                    "Dropping stale event"
                );
                return Ok(true);
            }
        }

        match msg {
            AssemblyEvent::Configure { reply } => self.configure(reply),
            AssemblyEvent::Setup {
                pointer,
                state,
                reply,
            } => {
                let answer = self.setup(pointer, state);
                let _ = reply.send(answer);
            }
            AssemblyEvent::Retrieve { pointer, reply } => {
                let _ = reply.send(self.assemblies.get(&pointer).cloned());
            }
            AssemblyEvent::Resolve {
                pointer,
                requester,
                contract,
                reuse,
                ..
            } => self.resolve_request(pointer, requester, contract, reuse),
            AssemblyEvent::Release { pointer, .. } => self.release_request(&pointer),
            AssemblyEvent::Report {
                pointer, assembly, ..
            } => self.report_instance(&pointer, assembly),
            AssemblyEvent::RemoveSystem { system, epoch } => {
                return Ok(self.remove_system(system, epoch));
            }
            AssemblyEvent::Unreachable { system } => {
                return Ok(self.remove_system(system, None));
            }
            AssemblyEvent::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
            AssemblyEvent::Shutdown => return Ok(false),
        }

        Ok(true)
    }

    async fn on_stop(&mut self, ctx: &mut ActorContext) {
        info!(
            app = %self.id,
            cancelled = ctx.cancelled,
            messages = ctx.messages_processed,
            "Application stopping"
        );

        if self.is_master() {
            for system in self.systems.clone() {
                if system != self.system {
                    self.send(system, Outbound::Remove);
                }
            }
            for (_, lease) in self.hooked.drain() {
                self.leases.unhook(lease);
            }
        }

        self.resources.release_all(self.id);

        // Pending configure callers observe the teardown as a failure.
        self.waiters.clear();
    }
}

#[cfg(test)]
mod tests;
