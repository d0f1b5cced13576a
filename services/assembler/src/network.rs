//! In-process network of assembler hosts.
//!
//! Every host gets its own view of the network, so a link can fail when
//! either of its ends is disconnected. Hosts are held weakly; a dropped
//! assembler is unreachable.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use plexus_contract::Contract;
use plexus_id::{ApplicationId, LeaseId, Phase, Pointer, SystemId};
use tokio::sync::watch;
use tracing::info;

use crate::assembler::Assembler;
use crate::config::Config;
use crate::container::Container;
use crate::lease::{Lease, LocalLeases};
use crate::model::{Assembly, AssemblyPointer, AssemblyState};
use crate::peer::{Peer, PeerDirectory, PeerError};

#[derive(Default)]
struct Links {
    hosts: RwLock<BTreeMap<SystemId, Weak<Assembler>>>,
    down: RwLock<HashSet<SystemId>>,
}

impl Links {
    fn is_down(&self, system: SystemId) -> bool {
        self.down
            .read()
            .map(|down| down.contains(&system))
            .unwrap_or(true)
    }
}

/// A set of hosts talking to each other in-process.
pub struct LocalNetwork {
    links: Arc<Links>,
    shutdown_tx: watch::Sender<bool>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            links: Arc::new(Links::default()),
            shutdown_tx,
        }
    }

    /// Starts a host on this network.
    pub fn host(&self, config: Config, container: Arc<dyn Container>) -> Arc<Assembler> {
        let system = config.system_id;
        let leases = Arc::new(LocalLeases::start(
            config.lease_check_interval,
            self.shutdown_tx.subscribe(),
        ));
        let assembler = Assembler::new(
            config,
            container,
            self.directory(system),
            leases,
            self.shutdown_tx.subscribe(),
        );
        self.attach(&assembler);
        assembler
    }

    /// The network as seen from `system`.
    pub fn directory(&self, system: SystemId) -> Arc<dyn PeerDirectory> {
        Arc::new(LocalDirectory {
            from: system,
            links: self.links.clone(),
        })
    }

    pub fn attach(&self, assembler: &Arc<Assembler>) {
        if let Ok(mut hosts) = self.links.hosts.write() {
            hosts.insert(assembler.system_id(), Arc::downgrade(assembler));
        }
    }

    /// Cuts every link to and from `system`.
    pub fn disconnect(&self, system: SystemId) {
        info!(system = %system, "Disconnecting host");
        if let Ok(mut down) = self.links.down.write() {
            down.insert(system);
        }
    }

    pub fn reconnect(&self, system: SystemId) {
        if let Ok(mut down) = self.links.down.write() {
            down.remove(&system);
        }
    }

    /// Stops lease sweepers and applications on every host.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

struct LocalDirectory {
    from: SystemId,
    links: Arc<Links>,
}

impl PeerDirectory for LocalDirectory {
    fn peer(&self, system: SystemId) -> Option<Arc<dyn Peer>> {
        let known = self
            .links
            .hosts
            .read()
            .map(|hosts| hosts.contains_key(&system))
            .unwrap_or(false);
        known.then(|| {
            Arc::new(LocalPeer {
                from: self.from,
                to: system,
                links: self.links.clone(),
            }) as Arc<dyn Peer>
        })
    }

    fn systems(&self) -> Vec<SystemId> {
        self.links
            .hosts
            .read()
            .map(|hosts| hosts.keys().copied().collect())
            .unwrap_or_default()
    }
}

struct LocalPeer {
    from: SystemId,
    to: SystemId,
    links: Arc<Links>,
}

impl LocalPeer {
    fn target(&self) -> Result<Arc<Assembler>, PeerError> {
        if self.links.is_down(self.from) || self.links.is_down(self.to) {
            return Err(PeerError::Unreachable(self.to));
        }
        self.links
            .hosts
            .read()
            .ok()
            .and_then(|hosts| hosts.get(&self.to).and_then(Weak::upgrade))
            .ok_or(PeerError::Unreachable(self.to))
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn system_id(&self) -> SystemId {
        self.to
    }

    async fn prepare(&self, app: ApplicationId) -> Result<Lease, PeerError> {
        self.target()?.prepare(app).await
    }

    async fn prepare_slave(
        &self,
        app: ApplicationId,
        master: SystemId,
        systems: Vec<SystemId>,
    ) -> Result<Lease, PeerError> {
        self.target()?.prepare_slave(app, master, systems).await
    }

    async fn configure(&self, app: ApplicationId) -> Result<Option<Assembly>, PeerError> {
        self.target()?.configure(app).await
    }

    async fn setup(
        &self,
        app: ApplicationId,
        pointer: Pointer,
        state: AssemblyState,
    ) -> Result<AssemblyPointer, PeerError> {
        self.target()?.setup(app, pointer, state).await
    }

    async fn retrieve(
        &self,
        app: ApplicationId,
        pointer: Pointer,
    ) -> Result<Option<Assembly>, PeerError> {
        self.target()?.retrieve(app, pointer).await
    }

    async fn remove(&self, app: ApplicationId) -> Result<(), PeerError> {
        self.target()?.remove(app).await
    }

    async fn remove_system(
        &self,
        app: ApplicationId,
        system: SystemId,
        epoch: Option<Phase>,
    ) -> Result<(), PeerError> {
        self.target()?.remove_system(app, system, epoch).await
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
        self.target()?
            .resolve(app, phase, pointer, requester, contract, reuse)
            .await
    }

    async fn release(
        &self,
        app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
    ) -> Result<(), PeerError> {
        self.target()?.release(app, phase, pointer).await
    }

    async fn report(
        &self,
        app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
        assembly: Option<Assembly>,
    ) -> Result<(), PeerError> {
        self.target()?.report(app, phase, pointer, assembly).await
    }

    async fn renew(&self, lease: LeaseId) -> Result<(), PeerError> {
        self.target()?.renew(lease).await
    }
}
