//! Participant removal and phase changes it causes.

use plexus_events::{DeviceRemovedPayload, LifecycleEvent};
use plexus_id::{Phase, SystemId};
use tracing::{debug, error, info, warn};

use super::{Application, Outbound};

impl Application {
    /// Removes `system` from the participants.
    ///
    /// `epoch` is the master's phase after the removal, `None` when the
    /// removal was detected locally. Returns false when this host itself was
    /// removed and the actor should stop.
    pub(super) fn remove_system(&mut self, system: SystemId, epoch: Option<Phase>) -> bool {
        if system == self.system {
            if self.is_master() {
                warn!(app = %self.id, "Master asked to remove itself; ignoring");
                return true;
            }
            info!(app = %self.id, "Removed from application");
            return false;
        }

        if !self.systems.contains(&system) {
            if let Some(epoch) = epoch {
                if epoch > self.phase && !self.is_master() {
                    self.enter_phase(epoch);
                }
            }
            debug!(app = %self.id, system = %system, "Removal of non-participant");
            return true;
        }

        self.systems.retain(|s| *s != system);
        let next = match epoch {
            Some(epoch) => epoch.max(self.phase),
            None => self.phase.next(),
        };
        if next > self.phase {
            self.enter_phase(next);
        }

        info!(
            app = %self.id,
            system = %system,
            phase = %self.phase,
            remaining = self.systems.len(),
            "Participant removed"
        );
        self.publish(LifecycleEvent::DeviceRemoved(DeviceRemovedPayload {
            system,
            phase: self.phase,
        }));

        if self.is_master() {
            if let Some(lease) = self.hooked.remove(&system) {
                self.leases.unhook(lease);
            }

            // Removals go out ahead of any resolve of the restarted root, so
            // no slave tries the removed host again.
            let epoch = Some(self.phase);
            for peer in self.systems.clone() {
                if peer != self.system {
                    self.send(peer, Outbound::RemoveSystem { system, epoch });
                }
            }
            self.send(system, Outbound::Remove);

            if self.configuring {
                self.restart_root();
            }
        } else if epoch.is_none() {
            if system == self.master {
                error!(app = %self.id, "Master unreachable; waiting for its lease to expire");
            } else {
                let master = self.master;
                self.send(
                    master,
                    Outbound::RemoveSystem {
                        system,
                        epoch: None,
                    },
                );
            }
        }

        true
    }
}
