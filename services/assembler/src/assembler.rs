//! The assembler service of one host.
//!
//! Owns one [`Application`] actor per application this host takes part in
//! and exposes the peer protocol on top of them. Every protocol call is
//! turned into an [`AssemblyEvent`] on the addressed application's mailbox.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use plexus_contract::{Contract, ContractError};
use plexus_events::EventEnvelope;
use plexus_id::{ApplicationId, LeaseId, Phase, Pointer, SystemId};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use crate::actors::{mailbox, ActorHandle, Mailbox, Supervisor};
use crate::application::{Application, ApplicationSnapshot, AssemblyEvent, HostContext};
use crate::config::Config;
use crate::container::{Container, ResourceSnapshot};
use crate::lease::{Lease, LeaseCallback, LivenessPort};
use crate::lifecycle::LifecyclePublisher;
use crate::model::{Assembly, AssemblyPointer, AssemblyState, AssemblyTree, ChildRef};
use crate::peer::{Peer, PeerDirectory, PeerError};
use crate::resources::ResourceMonitor;

#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("no assembly recorded at {0}")]
    MissingAssembly(Pointer),

    #[error("invalid contract: {0}")]
    Contract(#[from] ContractError),
}

struct Entry {
    actor_id: String,
    handle: ActorHandle<AssemblyEvent>,
    /// Lease this host granted for the application.
    lease: Option<LeaseId>,
}

struct Registry {
    supervisor: Supervisor,
    applications: HashMap<ApplicationId, Entry>,
}

pub struct Assembler {
    config: Config,
    host: HostContext,
    registry: Mutex<Registry>,
    shutdown: watch::Receiver<bool>,
}

impl Assembler {
    pub fn new(
        config: Config,
        container: Arc<dyn Container>,
        directory: Arc<dyn PeerDirectory>,
        leases: Arc<dyn LivenessPort>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.recompute(container.as_ref());

        let host = HostContext {
            system_id: config.system_id,
            container,
            directory,
            leases,
            lifecycle: LifecyclePublisher::new(config.system_id),
            resources: monitor,
            binding_seed: config.binding_seed,
        };

        info!(system_id = %config.system_id, "Assembler started");

        Arc::new(Self {
            registry: Mutex::new(Registry {
                supervisor: Supervisor::new(shutdown.clone()),
                applications: HashMap::new(),
            }),
            config,
            host,
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lifecycle events of every application on this host.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.host.lifecycle.subscribe()
    }

    /// Refreshes host capacity from the container, keeping every
    /// application's outstanding reservations charged.
    pub fn recompute_resources(&self) -> usize {
        self.host.resources.recompute(self.host.container.as_ref())
    }

    /// Free capacity left on this host.
    pub fn free_resources(&self) -> ResourceSnapshot {
        self.host.resources.current()
    }

    pub fn applications(&self) -> Vec<ApplicationId> {
        self.registry()
            .map(|r| {
                r.applications
                    .iter()
                    .filter(|(_, e)| !e.handle.is_closed())
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn inspect(&self, app: ApplicationId) -> Result<ApplicationSnapshot, PeerError> {
        self.ask(app, |reply| AssemblyEvent::Inspect { reply }).await
    }

    /// Records reuse hints for a whole tree, descending through the hosts
    /// each node reports for its children.
    pub async fn setup_tree(
        &self,
        app: ApplicationId,
        states: &HashMap<Pointer, AssemblyState>,
        root: Pointer,
    ) -> Result<usize, AssemblerError> {
        let mut work = vec![(self.system_id(), root)];
        let mut seeded = 0;
        while let Some((system, pointer)) = work.pop() {
            let state = states.get(&pointer).cloned().unwrap_or_default();
            let peer = self.peer(system)?;
            let answer = peer.setup(app, pointer, state).await?;
            seeded += 1;
            work.extend(
                answer
                    .instances
                    .into_iter()
                    .map(|child| (child.system_id, child.pointer)),
            );
        }
        Ok(seeded)
    }

    /// Gathers the assembly tree below `pointer` from every host holding a
    /// part of it.
    pub async fn retrieve_tree(
        &self,
        app: ApplicationId,
        pointer: Pointer,
    ) -> Result<AssemblyTree, AssemblerError> {
        let assembly = self
            .retrieve(app, pointer.clone())
            .await?
            .ok_or_else(|| AssemblerError::MissingAssembly(pointer.clone()))?;
        self.expand(app, pointer, assembly).await
    }

    fn expand<'a>(
        &'a self,
        app: ApplicationId,
        pointer: Pointer,
        assembly: Assembly,
    ) -> Pin<Box<dyn Future<Output = Result<AssemblyTree, AssemblerError>> + Send + 'a>> {
        Box::pin(async move {
            let mut instances = Vec::with_capacity(assembly.instances.len());
            for child in &assembly.instances {
                let found = self.fetch(app, child).await?;
                instances.push(self.expand(app, child.pointer.clone(), found).await?);
            }

            let mut resources = Vec::with_capacity(assembly.resources.len());
            for child in &assembly.resources {
                let found = self.fetch(app, child).await?;
                resources.push(self.expand(app, child.pointer.clone(), found).await?);
            }

            Ok(AssemblyTree {
                pointer,
                assembly,
                instances,
                resources,
            })
        })
    }

    async fn fetch(&self, app: ApplicationId, child: &ChildRef) -> Result<Assembly, AssemblerError> {
        self.peer(child.system_id)?
            .retrieve(app, child.pointer.clone())
            .await?
            .ok_or_else(|| AssemblerError::MissingAssembly(child.pointer.clone()))
    }

    fn peer(&self, system: SystemId) -> Result<Arc<dyn Peer>, PeerError> {
        self.host
            .directory
            .peer(system)
            .ok_or(PeerError::Unreachable(system))
    }

    /// Stops every application on this host.
    pub async fn shutdown(&self) {
        let supervisor = match self.registry.lock() {
            Ok(mut registry) => {
                registry.applications.clear();
                Some(std::mem::replace(
                    &mut registry.supervisor,
                    Supervisor::new(self.shutdown.clone()),
                ))
            }
            Err(_) => None,
        };
        if let Some(mut supervisor) = supervisor {
            supervisor.stop_all().await;
        }
        info!(system_id = %self.config.system_id, "Assembler stopped");
    }

    // =========================================================================
    // Registry
    // =========================================================================

    fn registry(&self) -> Result<MutexGuard<'_, Registry>, PeerError> {
        self.registry
            .lock()
            .map_err(|_| PeerError::Rejected("application registry poisoned".to_string()))
    }

    fn lookup(&self, app: ApplicationId) -> Result<ActorHandle<AssemblyEvent>, PeerError> {
        let mut registry = self.registry()?;
        match registry.applications.get(&app) {
            Some(entry) if !entry.handle.is_closed() => Ok(entry.handle.clone()),
            Some(_) => {
                // The actor stopped on its own.
                if let Some(entry) = registry.applications.remove(&app) {
                    if let Some(lease) = entry.lease {
                        self.host.leases.remove(lease);
                    }
                }
                Err(PeerError::UnknownApplication(app))
            }
            None => Err(PeerError::UnknownApplication(app)),
        }
    }

    async fn deliver(&self, app: ApplicationId, event: AssemblyEvent) -> Result<(), PeerError> {
        let handle = self.lookup(app)?;
        handle
            .send(event)
            .await
            .map_err(|_| PeerError::UnknownApplication(app))
    }

    async fn ask<T: Send>(
        &self,
        app: ApplicationId,
        make: impl FnOnce(oneshot::Sender<T>) -> AssemblyEvent,
    ) -> Result<T, PeerError> {
        let (tx, rx) = oneshot::channel();
        self.deliver(app, make(tx)).await?;
        rx.await.map_err(|_| PeerError::UnknownApplication(app))
    }

    fn spawn_application(
        &self,
        application: Application,
        app: ApplicationId,
        handle: ActorHandle<AssemblyEvent>,
        mailbox: Mailbox<AssemblyEvent>,
        lease: Option<LeaseId>,
    ) -> Result<(), PeerError> {
        let mut registry = self.registry()?;
        if let Some(previous) = registry.applications.remove(&app) {
            warn!(app = %app, "Replacing existing application");
            registry.supervisor.stop(&previous.actor_id);
            if let Some(lease) = previous.lease {
                self.host.leases.remove(lease);
            }
        }

        registry.supervisor.reap();
        let actor_id = registry.supervisor.spawn_with_mailbox(application, mailbox);
        registry.applications.insert(
            app,
            Entry {
                actor_id,
                handle,
                lease,
            },
        );
        Ok(())
    }
}

/// Lease callback that tears the application down.
fn shutdown_on_expiry(app: ApplicationId, handle: ActorHandle<AssemblyEvent>) -> LeaseCallback {
    Box::new(move || {
        tokio::spawn(async move {
            info!(app = %app, "Application lease expired; removing");
            if handle.send(AssemblyEvent::Shutdown).await.is_err() {
                debug!(app = %app, "Application already stopped");
            }
        });
    })
}

/// Lease callback that reports a participant as gone.
fn remove_on_loss(system: SystemId, handle: ActorHandle<AssemblyEvent>) -> LeaseCallback {
    Box::new(move || {
        tokio::spawn(async move {
            let _ = handle.send(AssemblyEvent::Unreachable { system }).await;
        });
    })
}

#[async_trait]
impl Peer for Assembler {
    fn system_id(&self) -> SystemId {
        self.config.system_id
    }

    async fn prepare(&self, app: ApplicationId) -> Result<Lease, PeerError> {
        if self.lookup(app).is_ok() {
            return Err(PeerError::Rejected(format!(
                "application {} already prepared",
                app
            )));
        }

        let me = self.system_id();
        let mut systems = self.host.directory.systems();
        if !systems.contains(&me) {
            systems.push(me);
        }

        let (handle, mailbox) = mailbox("application", self.config.mailbox_size);
        let mut hooked = HashMap::new();
        let mut unreachable = Vec::new();

        for system in systems.iter().copied().filter(|s| *s != me) {
            let peer = match self.peer(system) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(app = %app, system = %system, error = %e, "Participant unavailable");
                    unreachable.push(system);
                    continue;
                }
            };
            match peer.prepare_slave(app, me, systems.clone()).await {
                Ok(lease) => {
                    self.host
                        .leases
                        .hook(lease, peer, remove_on_loss(system, handle.clone()));
                    hooked.insert(system, lease.id);
                }
                Err(e) => {
                    warn!(app = %app, system = %system, error = %e, "Participant refused application");
                    unreachable.push(system);
                }
            }
        }

        let lease = self.host.leases.create_lease(
            self.config.lease_duration,
            shutdown_on_expiry(app, handle.clone()),
        );
        let application =
            Application::new(app, me, systems, self.host.clone(), handle.clone()).with_hooked(hooked);
        self.spawn_application(application, app, handle.clone(), mailbox, Some(lease.id))?;

        for system in unreachable {
            let _ = handle.send(AssemblyEvent::Unreachable { system }).await;
        }

        info!(app = %app, "Application prepared as master");
        Ok(lease)
    }

    async fn prepare_slave(
        &self,
        app: ApplicationId,
        master: SystemId,
        systems: Vec<SystemId>,
    ) -> Result<Lease, PeerError> {
        let (handle, mailbox) = mailbox("application", self.config.mailbox_size);
        let lease = self.host.leases.create_lease(
            self.config.lease_duration,
            shutdown_on_expiry(app, handle.clone()),
        );
        let application = Application::new(app, master, systems, self.host.clone(), handle.clone());
        self.spawn_application(application, app, handle, mailbox, Some(lease.id))?;

        info!(app = %app, master = %master, "Application prepared as slave");
        Ok(lease)
    }

    async fn configure(&self, app: ApplicationId) -> Result<Option<Assembly>, PeerError> {
        let (tx, rx) = oneshot::channel();
        self.deliver(app, AssemblyEvent::Configure { reply: tx })
            .await?;

        match tokio::time::timeout(self.config.configure_timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => {
                info!(app = %app, "Application removed during configuration");
                Ok(None)
            }
            Err(_) => {
                warn!(
                    app = %app,
                    timeout_secs = self.config.configure_timeout.as_secs(),
                    "Configuration timed out"
                );
                Ok(None)
            }
        }
    }

    async fn setup(
        &self,
        app: ApplicationId,
        pointer: Pointer,
        state: AssemblyState,
    ) -> Result<AssemblyPointer, PeerError> {
        self.ask(app, |reply| AssemblyEvent::Setup {
            pointer,
            state,
            reply,
        })
        .await
    }

    async fn retrieve(
        &self,
        app: ApplicationId,
        pointer: Pointer,
    ) -> Result<Option<Assembly>, PeerError> {
        self.ask(app, |reply| AssemblyEvent::Retrieve { pointer, reply })
            .await
    }

    async fn remove(&self, app: ApplicationId) -> Result<(), PeerError> {
        let entry = {
            let mut registry = self.registry()?;
            let entry = registry.applications.remove(&app);
            if let Some(entry) = &entry {
                registry.supervisor.stop(&entry.actor_id);
            }
            entry
        };

        let Some(entry) = entry else {
            return Err(PeerError::UnknownApplication(app));
        };
        if let Some(lease) = entry.lease {
            self.host.leases.remove(lease);
        }

        let returned = self.host.resources.release_all(app);
        info!(app = %app, allocators = returned, "Application removed");
        self.recompute_resources();
        Ok(())
    }

    async fn remove_system(
        &self,
        app: ApplicationId,
        system: SystemId,
        epoch: Option<Phase>,
    ) -> Result<(), PeerError> {
        self.deliver(app, AssemblyEvent::RemoveSystem { system, epoch })
            .await
    }

    async fn resolve(
        &self,
        app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
        requester: SystemId,
        contract: Contract,
        reuse: bool,
    ) -> Result<(), PeerError> {
        self.deliver(
            app,
            AssemblyEvent::Resolve {
                phase,
                pointer,
                requester,
                contract,
                reuse,
            },
        )
        .await
    }

    async fn release(
        &self,
        app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
    ) -> Result<(), PeerError> {
        self.deliver(app, AssemblyEvent::Release { phase, pointer })
            .await
    }

    async fn report(
        &self,
        app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
        assembly: Option<Assembly>,
    ) -> Result<(), PeerError> {
        self.deliver(
            app,
            AssemblyEvent::Report {
                phase,
                pointer,
                assembly,
            },
        )
        .await
    }

    async fn renew(&self, lease: LeaseId) -> Result<(), PeerError> {
        Ok(self.host.leases.renew(lease)?)
    }
}
