//! Ordered outbound delivery to peers.
//!
//! Each destination gets its own lane: an unbounded queue drained by one
//! task, so messages to one host arrive in the order they were sent and a
//! slow host never blocks the application or other lanes. Messages to the
//! local host take the same path.

use std::collections::HashMap;
use std::sync::Arc;

use plexus_contract::Contract;
use plexus_id::{ApplicationId, Phase, Pointer, SystemId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::actors::ActorHandle;
use crate::model::Assembly;
use crate::peer::{Peer, PeerDirectory, PeerError};

use super::AssemblyEvent;

/// A message queued for a peer.
#[derive(Debug, Clone)]
pub enum Outbound {
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
    Remove,
}

impl Outbound {
    fn kind(&self) -> &'static str {
        match self {
            Self::Resolve { .. } => "resolve",
            Self::Release { .. } => "release",
            Self::Report { .. } => "report",
            Self::RemoveSystem { .. } => "remove_system",
            Self::Remove => "remove",
        }
    }
}

pub struct Outbox {
    app: ApplicationId,
    directory: Arc<dyn PeerDirectory>,
    feedback: ActorHandle<AssemblyEvent>,
    lanes: HashMap<SystemId, mpsc::UnboundedSender<Outbound>>,
}

impl Outbox {
    /// `feedback` receives an [`AssemblyEvent::Unreachable`] whenever a
    /// delivery fails because its destination is unreachable.
    pub fn new(
        app: ApplicationId,
        directory: Arc<dyn PeerDirectory>,
        feedback: ActorHandle<AssemblyEvent>,
    ) -> Self {
        Self {
            app,
            directory,
            feedback,
            lanes: HashMap::new(),
        }
    }

    pub fn send(&mut self, to: SystemId, message: Outbound) {
        let lane = self.lanes.entry(to).or_insert_with(|| {
            spawn_lane(self.app, to, self.directory.clone(), self.feedback.clone())
        });

        if let Err(mpsc::error::SendError(message)) = lane.send(message) {
            // The lane task only ends when its sender is dropped.
            warn!(to = %to, kind = message.kind(), "Outbound lane closed; message dropped");
        }
    }
}

fn spawn_lane(
    app: ApplicationId,
    to: SystemId,
    directory: Arc<dyn PeerDirectory>,
    feedback: ActorHandle<AssemblyEvent>,
) -> mpsc::UnboundedSender<Outbound> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let kind = message.kind();
            let result = match directory.peer(to) {
                Some(peer) => deliver(peer.as_ref(), app, message).await,
                None => Err(PeerError::Unreachable(to)),
            };

            match result {
                Ok(()) => {}
                Err(e) if e.is_unreachable() => {
                    warn!(app = %app, to = %to, kind, "Peer unreachable");
                    if feedback
                        .send(AssemblyEvent::Unreachable { system: to })
                        .await
                        .is_err()
                    {
                        debug!(app = %app, "Application stopped; unreachable notice dropped");
                    }
                }
                Err(e) => {
                    debug!(app = %app, to = %to, kind, error = %e, "Delivery rejected");
                }
            }
        }
    });

    tx
}

async fn deliver(peer: &dyn Peer, app: ApplicationId, message: Outbound) -> Result<(), PeerError> {
    match message {
        Outbound::Resolve {
            phase,
            pointer,
            requester,
            contract,
            reuse,
        } => {
            peer.resolve(app, phase, pointer, requester, contract, reuse)
                .await
        }
        Outbound::Release { phase, pointer } => peer.release(app, phase, pointer).await,
        Outbound::Report {
            phase,
            pointer,
            assembly,
        } => peer.report(app, phase, pointer, assembly).await,
        Outbound::RemoveSystem { system, epoch } => peer.remove_system(app, system, epoch).await,
        Outbound::Remove => peer.remove(app).await,
    }
}
