//! Free-resource accounting.
//!
//! Every host keeps one [`ResourceMonitor`], shared by all applications on
//! it. The monitor owns the host's free table and remembers what each
//! application holds, so a phase change or a teardown can hand everything
//! back at once. Reservations are all-or-nothing across dimensions and are
//! returned breadth-first when an assembly tree is released.
//!
//! Recompute passes refresh capacity from the container and charge the
//! outstanding reservations against it. Passes never overlap: a request
//! arriving during a pass is coalesced into one rerun.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use plexus_id::{ApplicationId, ProviderId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::container::{Container, ResourceSnapshot};
use crate::model::Reservation;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("unknown allocator {0}")]
    UnknownAllocator(ProviderId),

    #[error("insufficient capacity on allocator {0}")]
    Insufficient(ProviderId),

    #[error("estimate has {estimate} dimensions but allocator {allocator} has {free}")]
    DimensionMismatch {
        allocator: ProviderId,
        estimate: usize,
        free: usize,
    },

    #[error("nothing reserved on allocator {0} covers the release")]
    NotReserved(ProviderId),
}

/// Free capacity per allocator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceTable {
    free: HashMap<ProviderId, Vec<i64>>,
}

impl ResourceTable {
    pub fn new(snapshot: ResourceSnapshot) -> Self {
        Self { free: snapshot }
    }

    pub fn free(&self, allocator: &ProviderId) -> Option<&[i64]> {
        self.free.get(allocator).map(Vec::as_slice)
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        self.free.clone()
    }

    /// Subtracts `estimate` from the allocator's free vector.
    ///
    /// Leaves the table untouched unless every dimension stays non-negative.
    /// An all-zero estimate always succeeds.
    pub fn reserve(&mut self, allocator: ProviderId, estimate: &[i64]) -> Result<(), ResourceError> {
        if estimate.iter().all(|v| *v == 0) {
            return Ok(());
        }

        let free = self
            .free
            .get_mut(&allocator)
            .ok_or(ResourceError::UnknownAllocator(allocator))?;

        if estimate.len() > free.len() {
            return Err(ResourceError::DimensionMismatch {
                allocator,
                estimate: estimate.len(),
                free: free.len(),
            });
        }

        let previous = free.clone();
        for (slot, amount) in free.iter_mut().zip(estimate) {
            *slot -= amount;
        }

        if free.iter().any(|v| *v < 0) {
            *free = previous;
            return Err(ResourceError::Insufficient(allocator));
        }

        Ok(())
    }

    /// Adds `estimate` back to the allocator's free vector.
    pub fn release(&mut self, allocator: ProviderId, estimate: &[i64]) -> Result<(), ResourceError> {
        if estimate.iter().all(|v| *v == 0) {
            return Ok(());
        }

        let free = self
            .free
            .get_mut(&allocator)
            .ok_or(ResourceError::UnknownAllocator(allocator))?;

        if estimate.len() > free.len() {
            return Err(ResourceError::DimensionMismatch {
                allocator,
                estimate: estimate.len(),
                free: free.len(),
            });
        }

        for (slot, amount) in free.iter_mut().zip(estimate) {
            *slot += amount;
        }
        Ok(())
    }

    /// Subtracts `amount` without a capacity check. Returns false if the
    /// allocator is unknown.
    fn charge(&mut self, allocator: &ProviderId, amount: &[i64]) -> bool {
        let Some(free) = self.free.get_mut(allocator) else {
            return false;
        };
        for (slot, amount) in free.iter_mut().zip(amount) {
            *slot -= amount;
        }
        true
    }
}

// =============================================================================
// Recompute latch
// =============================================================================

#[derive(Debug, Default)]
struct LatchState {
    running: bool,
    rerun: bool,
}

/// Swallow-and-coalesce guard for recompute passes.
#[derive(Debug, Default)]
pub struct RecomputeLatch {
    state: Mutex<LatchState>,
}

impl RecomputeLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the caller should run a pass now. Otherwise a rerun
    /// is recorded for the pass in progress.
    pub fn begin(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.running {
            state.rerun = true;
            false
        } else {
            state.running = true;
            true
        }
    }

    /// Ends a pass. Returns true if a rerun was requested meanwhile, in
    /// which case the caller still holds the latch and must run again.
    pub fn finish(&self) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if state.rerun {
            state.rerun = false;
            true
        } else {
            state.running = false;
            false
        }
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Amounts reserved per allocator.
type Holdings = HashMap<ProviderId, Vec<i64>>;

#[derive(Debug, Default)]
struct Ledger {
    table: ResourceTable,
    held: HashMap<ApplicationId, Holdings>,
}

/// The host's free-resource table, shared by every application on the host.
#[derive(Debug, Default)]
pub struct ResourceMonitor {
    latch: RecomputeLatch,
    ledger: Mutex<Ledger>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Free capacity left on the host.
    pub fn current(&self) -> ResourceSnapshot {
        self.ledger().table.snapshot()
    }

    /// What `app` currently holds, per allocator.
    pub fn held(&self, app: ApplicationId) -> ResourceSnapshot {
        self.ledger().held.get(&app).cloned().unwrap_or_default()
    }

    /// Reserves `estimate` on behalf of `app`.
    pub fn reserve(
        &self,
        app: ApplicationId,
        allocator: ProviderId,
        estimate: &[i64],
    ) -> Result<(), ResourceError> {
        let mut ledger = self.ledger();
        ledger.table.reserve(allocator, estimate)?;
        if estimate.iter().all(|v| *v == 0) {
            return Ok(());
        }

        let held = ledger
            .held
            .entry(app)
            .or_default()
            .entry(allocator)
            .or_default();
        if held.len() < estimate.len() {
            held.resize(estimate.len(), 0);
        }
        for (slot, amount) in held.iter_mut().zip(estimate) {
            *slot += amount;
        }
        Ok(())
    }

    /// Hands `estimate` back. Fails without touching the table unless `app`
    /// holds at least that much on the allocator.
    pub fn release(
        &self,
        app: ApplicationId,
        allocator: ProviderId,
        estimate: &[i64],
    ) -> Result<(), ResourceError> {
        if estimate.iter().all(|v| *v == 0) {
            return Ok(());
        }

        let mut ledger = self.ledger();
        let covered = ledger
            .held
            .get(&app)
            .and_then(|holdings| holdings.get(&allocator))
            .is_some_and(|held| {
                held.len() >= estimate.len() && held.iter().zip(estimate).all(|(h, e)| h >= e)
            });
        if !covered {
            return Err(ResourceError::NotReserved(allocator));
        }

        ledger.table.release(allocator, estimate)?;

        if let Some(holdings) = ledger.held.get_mut(&app) {
            if let Some(held) = holdings.get_mut(&allocator) {
                for (slot, amount) in held.iter_mut().zip(estimate) {
                    *slot -= amount;
                }
                if held.iter().all(|v| *v == 0) {
                    holdings.remove(&allocator);
                }
            }
            if holdings.is_empty() {
                ledger.held.remove(&app);
            }
        }
        Ok(())
    }

    /// Returns every estimate reserved under `reservation`, breadth-first.
    pub fn release_tree(&self, app: ApplicationId, reservation: &Reservation) {
        let mut work = VecDeque::from([reservation]);
        while let Some(node) = work.pop_front() {
            let assembly = &node.assembly;
            if let Err(e) = self.release(app, assembly.creator_id, &assembly.template.estimate) {
                warn!(app = %app, pointer = %node.pointer, error = %e, "Failed to return reserved resources");
            }
            work.extend(node.children.iter());
        }
    }

    /// Returns everything `app` still holds. Returns the number of
    /// allocators credited.
    pub fn release_all(&self, app: ApplicationId) -> usize {
        let mut ledger = self.ledger();
        let Some(holdings) = ledger.held.remove(&app) else {
            return 0;
        };

        let mut credited = 0;
        for (allocator, amount) in &holdings {
            match ledger.table.release(*allocator, amount) {
                Ok(()) => credited += 1,
                Err(e) => warn!(app = %app, error = %e, "Failed to return held resources"),
            }
        }
        debug!(app = %app, allocators = credited, "Returned held resources");
        credited
    }

    /// Reads the container and charges outstanding reservations against
    /// the new capacity. Returns the number of passes run by this call,
    /// zero if it was coalesced into a running one.
    pub fn recompute(&self, container: &dyn Container) -> usize {
        if !self.latch.begin() {
            debug!("Resource recompute already running; coalesced");
            return 0;
        }

        let mut passes = 0;
        loop {
            passes += 1;
            match container.get_resources() {
                Ok(snapshot) => {
                    let mut ledger = self.ledger();
                    let mut table = ResourceTable::new(snapshot);
                    for (app, holdings) in &ledger.held {
                        for (allocator, amount) in holdings {
                            if !table.charge(allocator, amount) {
                                warn!(app = %app, allocator = %allocator, "Held resources on a vanished allocator");
                            }
                        }
                    }
                    ledger.table = table;
                }
                Err(e) => warn!(error = %e, "Keeping previous resource snapshot"),
            }
            if !self.latch.finish() {
                break;
            }
        }
        passes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::StaticContainer;
    use crate::model::Assembly;
    use plexus_contract::Contract;
    use plexus_id::{ContainerId, Pointer, SystemId};
    use proptest::prelude::*;
    use rstest::rstest;

    fn table(allocator: ProviderId, free: Vec<i64>) -> ResourceTable {
        ResourceTable::new(HashMap::from([(allocator, free)]))
    }

    fn reservation(pointer: Pointer, allocator: ProviderId, estimate: Vec<i64>) -> Reservation {
        let name = pointer.last().map(|s| s.name.clone()).unwrap_or_default();
        Reservation {
            assembly: Assembly {
                system_id: SystemId::new(),
                container_id: ContainerId::new(),
                creator_id: allocator,
                element_id: None,
                template: Contract::resource_template(name.clone(), estimate),
                name,
                instances: Vec::new(),
                resources: Vec::new(),
            },
            pointer,
            children: Vec::new(),
        }
    }

    #[test]
    fn test_reserve_is_all_or_nothing() {
        let alloc = ProviderId::new();
        let mut table = table(alloc, vec![1, 5]);

        assert_eq!(
            table.reserve(alloc, &[2, 0]),
            Err(ResourceError::Insufficient(alloc))
        );
        assert_eq!(table.free(&alloc), Some(&[1, 5][..]));

        table.reserve(alloc, &[1, 3]).unwrap();
        assert_eq!(table.free(&alloc), Some(&[0, 2][..]));
    }

    #[rstest]
    #[case::fits(vec![1, 5], vec![1, 5], Some(vec![0, 0]))]
    #[case::first_dimension_short(vec![1, 5], vec![2, 0], None)]
    #[case::second_dimension_short(vec![4, 1], vec![1, 2], None)]
    #[case::shorter_estimate(vec![3, 3], vec![2], Some(vec![1, 3]))]
    fn test_reserve_cases(
        #[case] free: Vec<i64>,
        #[case] estimate: Vec<i64>,
        #[case] expected: Option<Vec<i64>>,
    ) {
        let alloc = ProviderId::new();
        let mut table = table(alloc, free.clone());

        let reserved = table.reserve(alloc, &estimate).is_ok();
        assert_eq!(reserved, expected.is_some());
        let after = expected.unwrap_or(free);
        assert_eq!(table.free(&alloc), Some(after.as_slice()));
    }

    #[test]
    fn test_zero_estimate_needs_no_allocator() {
        let mut table = ResourceTable::default();
        assert!(table.reserve(ProviderId::new(), &[]).is_ok());
        assert!(table.reserve(ProviderId::new(), &[0, 0]).is_ok());
    }

    #[test]
    fn test_unknown_allocator_and_dimension_mismatch() {
        let alloc = ProviderId::new();
        let other = ProviderId::new();
        let mut table = table(alloc, vec![3]);

        assert_eq!(
            table.reserve(other, &[1]),
            Err(ResourceError::UnknownAllocator(other))
        );
        assert!(matches!(
            table.reserve(alloc, &[1, 1]),
            Err(ResourceError::DimensionMismatch { .. })
        ));
        assert_eq!(table.free(&alloc), Some(&[3][..]));
    }

    fn host_monitor(allocator: ProviderId, capacity: Vec<i64>) -> (StaticContainer, ResourceMonitor) {
        let container = StaticContainer::new().with_allocator(
            allocator,
            vec![Contract::resource_template("memory", vec![1])],
            capacity,
        );
        let monitor = ResourceMonitor::new();
        monitor.recompute(&container);
        (container, monitor)
    }

    #[test]
    fn test_release_tree_returns_every_node() {
        let alloc = ProviderId::new();
        let (_container, monitor) = host_monitor(alloc, vec![10, 10]);
        let app = ApplicationId::new();

        let root = Pointer::root("shop").resource("disk");
        let mut tree = reservation(root.clone(), alloc, vec![2, 1]);
        let mut cache = reservation(root.resource("cache"), alloc, vec![1, 1]);
        cache
            .children
            .push(reservation(root.resource("cache").resource("page"), alloc, vec![0, 3]));
        tree.children.push(cache);

        monitor.reserve(app, alloc, &[2, 1]).unwrap();
        monitor.reserve(app, alloc, &[1, 1]).unwrap();
        monitor.reserve(app, alloc, &[0, 3]).unwrap();
        assert_eq!(monitor.current()[&alloc], vec![7, 5]);
        assert_eq!(monitor.held(app)[&alloc], vec![3, 5]);

        monitor.release_tree(app, &tree);
        assert_eq!(monitor.current()[&alloc], vec![10, 10]);
        assert!(monitor.held(app).is_empty());
    }

    #[test]
    fn test_applications_share_host_capacity() {
        let alloc = ProviderId::new();
        let (_container, monitor) = host_monitor(alloc, vec![1]);
        let first = ApplicationId::new();
        let second = ApplicationId::new();

        monitor.reserve(first, alloc, &[1]).unwrap();
        assert_eq!(
            monitor.reserve(second, alloc, &[1]),
            Err(ResourceError::Insufficient(alloc))
        );

        // Only the holder can hand capacity back.
        assert_eq!(
            monitor.release(second, alloc, &[1]),
            Err(ResourceError::NotReserved(alloc))
        );
        assert_eq!(monitor.current()[&alloc], vec![0]);

        assert_eq!(monitor.release_all(first), 1);
        assert_eq!(monitor.release_all(first), 0);
        monitor.reserve(second, alloc, &[1]).unwrap();
        assert_eq!(monitor.current()[&alloc], vec![0]);
    }

    #[test]
    fn test_latch_coalesces_requests() {
        let latch = RecomputeLatch::new();
        assert!(latch.begin());
        assert!(!latch.begin());
        assert!(!latch.begin());
        // One rerun for any number of coalesced requests.
        assert!(latch.finish());
        assert!(!latch.finish());
        assert!(latch.begin());
    }

    #[test]
    fn test_monitor_reads_container_snapshot() {
        let alloc = ProviderId::new();
        let (container, monitor) = host_monitor(alloc, vec![8]);
        assert_eq!(monitor.current()[&alloc], vec![8]);

        container.set_reachable(false);
        assert_eq!(monitor.recompute(&container), 1);
        assert_eq!(monitor.current()[&alloc], vec![8]);
    }

    #[test]
    fn test_recompute_keeps_outstanding_reservations() {
        let alloc = ProviderId::new();
        let (container, monitor) = host_monitor(alloc, vec![8]);
        let app = ApplicationId::new();
        monitor.reserve(app, alloc, &[3]).unwrap();

        container.set_capacity(alloc, vec![10]);
        monitor.recompute(&container);
        assert_eq!(monitor.current()[&alloc], vec![7]);

        monitor.release(app, alloc, &[3]).unwrap();
        assert_eq!(monitor.current()[&alloc], vec![10]);
    }

    proptest! {
        #[test]
        fn prop_reserve_release_accounting(
            initial in proptest::collection::vec(0i64..20, 3),
            ops in proptest::collection::vec((proptest::collection::vec(0i64..8, 3), any::<bool>()), 1..40),
        ) {
            let alloc = ProviderId::new();
            let mut table = table(alloc, initial.clone());
            let mut held: Vec<Vec<i64>> = Vec::new();

            for (estimate, release_first) in ops {
                if release_first && !held.is_empty() {
                    let returned = held.remove(0);
                    table.release(alloc, &returned).unwrap();
                }
                if table.reserve(alloc, &estimate).is_ok() {
                    held.push(estimate);
                }

                let free = table.free(&alloc).unwrap();
                prop_assert!(free.iter().all(|v| *v >= 0));
                for dim in 0..initial.len() {
                    let reserved: i64 = held.iter().map(|e| e[dim]).sum();
                    prop_assert_eq!(free[dim] + reserved, initial[dim]);
                }
            }
        }
    }
}
