//! Peer protocol between assembler hosts.
//!
//! Every operation addresses one application. The one-way operations
//! (`resolve`, `release`, `report`, `remove_system`) only enqueue an event on
//! the receiving application; their result tells the sender whether the
//! message was delivered, never how it was handled.

use std::sync::Arc;

use async_trait::async_trait;
use plexus_contract::Contract;
use plexus_id::{ApplicationId, LeaseId, Phase, Pointer, SystemId};
use thiserror::Error;

use crate::lease::{Lease, LeaseError};
use crate::model::{Assembly, AssemblyPointer, AssemblyState};

#[derive(Debug, Error)]
pub enum PeerError {
    /// The host could not be reached. Senders treat this as the host having
    /// left the application.
    #[error("system {0} unreachable")]
    Unreachable(SystemId),

    #[error("unknown application {0}")]
    UnknownApplication(ApplicationId),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Lease(#[from] LeaseError),
}

impl PeerError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Remote surface of one assembler host.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Host this peer talks to.
    fn system_id(&self) -> SystemId;

    /// Creates the application with the receiver as master. The returned
    /// lease must be renewed by the caller for the application to live.
    async fn prepare(&self, app: ApplicationId) -> Result<Lease, PeerError>;

    /// Creates a slave application. The lease is held by the master.
    async fn prepare_slave(
        &self,
        app: ApplicationId,
        master: SystemId,
        systems: Vec<SystemId>,
    ) -> Result<Lease, PeerError>;

    /// Resolves the whole tree. `None` when resolution failed.
    async fn configure(&self, app: ApplicationId) -> Result<Option<Assembly>, PeerError>;

    /// Records a reuse hint for `pointer`.
    async fn setup(
        &self,
        app: ApplicationId,
        pointer: Pointer,
        state: AssemblyState,
    ) -> Result<AssemblyPointer, PeerError>;

    async fn retrieve(
        &self,
        app: ApplicationId,
        pointer: Pointer,
    ) -> Result<Option<Assembly>, PeerError>;

    /// Tears down the application on the receiving host.
    async fn remove(&self, app: ApplicationId) -> Result<(), PeerError>;

    /// Removes `system` from the participants. `epoch` is the master's phase
    /// after the removal; `None` for a locally detected removal.
    async fn remove_system(
        &self,
        app: ApplicationId,
        system: SystemId,
        epoch: Option<Phase>,
    ) -> Result<(), PeerError>;

    async fn resolve(
        &self,
        app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
        requester: SystemId,
        contract: Contract,
        reuse: bool,
    ) -> Result<(), PeerError>;

    async fn release(
        &self,
        app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
    ) -> Result<(), PeerError>;

    async fn report(
        &self,
        app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
        assembly: Option<Assembly>,
    ) -> Result<(), PeerError>;

    /// Renews a lease granted by the receiving host.
    async fn renew(&self, lease: LeaseId) -> Result<(), PeerError>;
}

/// Resolves host ids to peers.
pub trait PeerDirectory: Send + Sync {
    fn peer(&self, system: SystemId) -> Option<Arc<dyn Peer>>;

    /// Every host currently known, including the local one.
    fn systems(&self) -> Vec<SystemId>;
}
