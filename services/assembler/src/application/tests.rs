use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use plexus_contract::Contract;
use plexus_events::BindingState;
use plexus_id::{ContainerId, LeaseId, ProviderId};
use tokio::sync::{mpsc, watch};

use super::*;
use crate::actors::{mailbox, Supervisor};
use crate::container::StaticContainer;
use crate::lease::{Lease, LocalLeases};
use crate::peer::{Peer, PeerError};

// =============================================================================
// Recording network
// =============================================================================

type Sent = (SystemId, Outbound);

/// Peer that records what it is sent instead of delivering it.
struct RecordingPeer {
    to: SystemId,
    tx: mpsc::UnboundedSender<Sent>,
    unreachable: Arc<Mutex<HashSet<SystemId>>>,
}

impl RecordingPeer {
    fn record(&self, message: Outbound) -> Result<(), PeerError> {
        if self.unreachable.lock().unwrap().contains(&self.to) {
            return Err(PeerError::Unreachable(self.to));
        }
        let _ = self.tx.send((self.to, message));
        Ok(())
    }
}

#[async_trait]
impl Peer for RecordingPeer {
    fn system_id(&self) -> SystemId {
        self.to
    }

    async fn prepare(&self, _app: ApplicationId) -> Result<Lease, PeerError> {
        Err(PeerError::Rejected("not recorded".into()))
    }

    async fn prepare_slave(
        &self,
        _app: ApplicationId,
        _master: SystemId,
        _systems: Vec<SystemId>,
    ) -> Result<Lease, PeerError> {
        Err(PeerError::Rejected("not recorded".into()))
    }

    async fn configure(&self, _app: ApplicationId) -> Result<Option<Assembly>, PeerError> {
        Err(PeerError::Rejected("not recorded".into()))
    }

    async fn setup(
        &self,
        _app: ApplicationId,
        _pointer: Pointer,
        _state: AssemblyState,
    ) -> Result<AssemblyPointer, PeerError> {
        Err(PeerError::Rejected("not recorded".into()))
    }

    async fn retrieve(
        &self,
        _app: ApplicationId,
        _pointer: Pointer,
    ) -> Result<Option<Assembly>, PeerError> {
        Err(PeerError::Rejected("not recorded".into()))
    }

    async fn remove(&self, _app: ApplicationId) -> Result<(), PeerError> {
        self.record(Outbound::Remove)
    }

    async fn remove_system(
        &self,
        _app: ApplicationId,
        system: SystemId,
        epoch: Option<Phase>,
    ) -> Result<(), PeerError> {
        self.record(Outbound::RemoveSystem { system, epoch })
    }

    async fn resolve(
        &self,
        _app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
        requester: SystemId,
        contract: Contract,
        reuse: bool,
    ) -> Result<(), PeerError> {
        self.record(Outbound::Resolve {
            phase,
            pointer,
            requester,
            contract,
            reuse,
        })
    }

    async fn release(
        &self,
        _app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
    ) -> Result<(), PeerError> {
        self.record(Outbound::Release { phase, pointer })
    }

    async fn report(
        &self,
        _app: ApplicationId,
        phase: Phase,
        pointer: Pointer,
        assembly: Option<Assembly>,
    ) -> Result<(), PeerError> {
        self.record(Outbound::Report {
            phase,
            pointer,
            assembly,
        })
    }

    async fn renew(&self, _lease: LeaseId) -> Result<(), PeerError> {
        Ok(())
    }
}

struct RecordingDirectory {
    systems: Vec<SystemId>,
    tx: mpsc::UnboundedSender<Sent>,
    unreachable: Arc<Mutex<HashSet<SystemId>>>,
}

impl PeerDirectory for RecordingDirectory {
    fn peer(&self, system: SystemId) -> Option<Arc<dyn Peer>> {
        Some(Arc::new(RecordingPeer {
            to: system,
            tx: self.tx.clone(),
            unreachable: self.unreachable.clone(),
        }))
    }

    fn systems(&self) -> Vec<SystemId> {
        self.systems.clone()
    }
}

fn into_event(message: Outbound) -> AssemblyEvent {
    match message {
        Outbound::Resolve {
            phase,
            pointer,
            requester,
            contract,
            reuse,
        } => AssemblyEvent::Resolve {
            phase,
            pointer,
            requester,
            contract,
            reuse,
        },
        Outbound::Release { phase, pointer } => AssemblyEvent::Release { phase, pointer },
        Outbound::Report {
            phase,
            pointer,
            assembly,
        } => AssemblyEvent::Report {
            phase,
            pointer,
            assembly,
        },
        Outbound::RemoveSystem { system, epoch } => AssemblyEvent::RemoveSystem { system, epoch },
        Outbound::Remove => AssemblyEvent::Shutdown,
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    me: SystemId,
    handle: ActorHandle<AssemblyEvent>,
    sent: mpsc::UnboundedReceiver<Sent>,
    /// Messages addressed to other hosts, in arrival order.
    remote: Vec<Sent>,
    unreachable: Arc<Mutex<HashSet<SystemId>>>,
    resources: Arc<ResourceMonitor>,
    _supervisor: Supervisor,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    fn start(me: SystemId, master: SystemId, others: &[SystemId], container: StaticContainer) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, sent) = mpsc::unbounded_channel();
        let unreachable = Arc::new(Mutex::new(HashSet::new()));

        let mut systems = vec![me];
        systems.extend_from_slice(others);

        let resources = Arc::new(ResourceMonitor::new());
        resources.recompute(&container);

        let host = HostContext {
            system_id: me,
            container: Arc::new(container),
            directory: Arc::new(RecordingDirectory {
                systems: systems.clone(),
                tx,
                unreachable: unreachable.clone(),
            }),
            leases: Arc::new(LocalLeases::start(Duration::from_secs(3600), shutdown_rx.clone())),
            lifecycle: LifecyclePublisher::new(me),
            resources: resources.clone(),
            binding_seed: Some(7),
        };

        let (handle, mailbox) = mailbox("application", 64);
        let application = Application::new(ApplicationId::new(), master, systems, host, handle.clone());
        let mut supervisor = Supervisor::new(shutdown_rx);
        supervisor.spawn_with_mailbox(application, mailbox);

        Self {
            me,
            handle,
            sent,
            remote: Vec::new(),
            unreachable,
            resources,
            _supervisor: supervisor,
            _shutdown: shutdown_tx,
        }
    }

    async fn send(&self, event: AssemblyEvent) {
        self.handle.send(event).await.unwrap();
    }

    async fn next(&mut self) -> Sent {
        tokio::time::timeout(Duration::from_secs(2), self.sent.recv())
            .await
            .expect("no message sent")
            .expect("recording channel closed")
    }

    /// Next message for another host; local ones are delivered back.
    async fn next_remote(&mut self) -> Sent {
        if !self.remote.is_empty() {
            return self.remote.remove(0);
        }
        loop {
            let (to, message) = self.next().await;
            if to == self.me {
                self.send(into_event(message)).await;
            } else {
                return (to, message);
            }
        }
    }

    /// Delivers local messages back until `rx` answers.
    async fn pump<T>(&mut self, mut rx: oneshot::Receiver<T>) -> T {
        let deadline = tokio::time::sleep(Duration::from_secs(2));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                answer = &mut rx => return answer.expect("reply dropped"),
                Some((to, message)) = self.sent.recv() => {
                    if to == self.me {
                        self.send(into_event(message)).await;
                    } else {
                        self.remote.push((to, message));
                    }
                }
                _ = &mut deadline => panic!("no answer"),
            }
        }
    }

    async fn quiet(&mut self) {
        let extra = tokio::time::timeout(Duration::from_millis(100), self.sent.recv()).await;
        assert!(extra.is_err(), "unexpected message: {:?}", extra);
    }

    async fn snapshot(&self) -> ApplicationSnapshot {
        let (reply, rx) = oneshot::channel();
        self.send(AssemblyEvent::Inspect { reply }).await;
        rx.await.unwrap()
    }

    async fn setup(&mut self, pointer: Pointer, state: AssemblyState) -> AssemblyPointer {
        let (reply, rx) = oneshot::channel();
        self.send(AssemblyEvent::Setup {
            pointer,
            state,
            reply,
        })
        .await;
        rx.await.unwrap()
    }

    async fn configure(&mut self) -> Option<Assembly> {
        let (reply, rx) = oneshot::channel();
        self.send(AssemblyEvent::Configure { reply }).await;
        self.pump(rx).await
    }

    fn set_unreachable(&self, system: SystemId) {
        self.unreachable.lock().unwrap().insert(system);
    }
}

/// Waits for the host to report `free` on `allocator`.
async fn eventually_free(harness: &Harness, allocator: ProviderId, free: Vec<i64>) -> bool {
    for _ in 0..50 {
        if harness.resources.current().get(&allocator) == Some(&free) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn child_assembly(name: &str, system_id: SystemId) -> Assembly {
    Assembly {
        system_id,
        container_id: ContainerId::new(),
        creator_id: ProviderId::new(),
        element_id: None,
        template: Contract::instance_template(name),
        name: name.to_string(),
        instances: Vec::new(),
        resources: Vec::new(),
    }
}

fn root_state(creator: ProviderId, template: Contract) -> AssemblyState {
    AssemblyState {
        creator_id: Some(creator),
        templates: vec![template],
        ..AssemblyState::default()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_single_host_configures_tree() {
    let me = SystemId::new();
    let db_creator = ProviderId::new();
    let allocator = ProviderId::new();
    let container = StaticContainer::new()
        .with_creator(db_creator, vec![Contract::instance_template("db")])
        .with_allocator(
            allocator,
            vec![Contract::resource_template("memory", vec![1])],
            vec![2],
        );
    let mut harness = Harness::start(me, me, &[], container);

    let root = Pointer::root("shop");
    let template = Contract::instance_template("shop")
        .with_child(Contract::instance_demand("db"))
        .with_child(Contract::resource_demand("memory"));
    harness
        .setup(root.clone(), root_state(ProviderId::new(), template))
        .await;

    let assembly = harness.configure().await.expect("configuration failed");
    assert_eq!(assembly.instances.len(), 1);
    assert_eq!(assembly.instances[0].pointer, root.instance("db"));
    assert_eq!(assembly.instances[0].system_id, me);
    assert_eq!(assembly.resources.len(), 1);
    assert_eq!(assembly.resources[0].pointer, root.resource("memory"));

    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.phase, Phase::new(1));
    assert!(!snapshot.configuring);
    assert!(snapshot.requests.is_empty());
    assert_eq!(snapshot.completed, vec![root.clone(), root.instance("db")]);
    assert_eq!(snapshot.free[&allocator], vec![1]);
}

#[tokio::test]
async fn test_new_phase_returns_previous_reservations() {
    let me = SystemId::new();
    let allocator = ProviderId::new();
    let container = StaticContainer::new().with_allocator(
        allocator,
        vec![Contract::resource_template("memory", vec![2])],
        vec![3],
    );
    let mut harness = Harness::start(me, me, &[], container);

    let root = Pointer::root("shop");
    let template = Contract::instance_template("shop").with_child(Contract::resource_demand("memory"));
    harness
        .setup(root.clone(), root_state(ProviderId::new(), template))
        .await;

    assert!(harness.configure().await.is_some());
    let first = harness.snapshot().await;
    assert_eq!(first.free[&allocator], vec![1]);
    assert_eq!(first.held[&allocator], vec![2]);

    // Only one reservation fits, so the second phase must hand the first back.
    assert!(harness.configure().await.is_some());
    let second = harness.snapshot().await;
    assert_eq!(second.phase, Phase::new(2));
    assert_eq!(second.free[&allocator], vec![1]);
    assert_eq!(second.held[&allocator], vec![2]);

    harness.send(AssemblyEvent::Shutdown).await;
    assert!(eventually_free(&harness, allocator, vec![3]).await);
}

#[tokio::test]
async fn test_insufficient_resources_leave_table_untouched() {
    let me = SystemId::new();
    let allocator = ProviderId::new();
    let container = StaticContainer::new().with_allocator(
        allocator,
        vec![Contract::resource_template("disk", vec![2, 0])],
        vec![1, 5],
    );
    let mut harness = Harness::start(me, me, &[], container);

    let root = Pointer::root("shop");
    let template = Contract::instance_template("shop").with_child(Contract::resource_demand("disk"));
    harness
        .setup(root.clone(), root_state(ProviderId::new(), template))
        .await;

    assert!(harness.configure().await.is_none());
    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.free[&allocator], vec![1, 5]);
    assert!(snapshot.requests.is_empty());
}

#[tokio::test]
async fn test_configure_without_root_state_fails() {
    let me = SystemId::new();
    let mut harness = Harness::start(me, me, &[], StaticContainer::new());
    assert!(harness.configure().await.is_none());
}

#[tokio::test]
async fn test_configure_on_slave_is_refused() {
    let me = SystemId::new();
    let master = SystemId::new();
    let mut harness = Harness::start(me, master, &[], StaticContainer::new());
    assert!(harness.configure().await.is_none());
}

#[tokio::test]
async fn test_no_candidates_reports_failure_upward() {
    let me = SystemId::new();
    let master = SystemId::new();
    let mut harness = Harness::start(me, master, &[master], StaticContainer::new());

    let pointer = Pointer::root("shop").instance("db");
    harness
        .send(AssemblyEvent::Resolve {
            phase: Phase::INITIAL,
            pointer: pointer.clone(),
            requester: master,
            contract: Contract::instance_demand("db"),
            reuse: false,
        })
        .await;

    let (to, message) = harness.next().await;
    assert_eq!(to, master);
    assert!(matches!(
        message,
        Outbound::Report { pointer: p, assembly: None, .. } if p == pointer
    ));
    assert!(harness.snapshot().await.requests.is_empty());
}

#[tokio::test]
async fn test_release_waits_for_every_child() {
    let me = SystemId::new();
    let master = SystemId::new();
    let template = Contract::instance_template("api")
        .with_child(Contract::instance_demand("a"))
        .with_child(Contract::instance_demand("b"))
        .with_child(Contract::instance_demand("c"));
    let container = StaticContainer::new().with_creator(ProviderId::new(), vec![template]);
    let mut harness = Harness::start(me, master, &[master], container);

    let pointer = Pointer::root("shop").instance("api");
    harness
        .send(AssemblyEvent::Resolve {
            phase: Phase::INITIAL,
            pointer: pointer.clone(),
            requester: master,
            contract: Contract::instance_demand("api"),
            reuse: false,
        })
        .await;

    // Three resolves, wherever they were placed.
    let mut children = Vec::new();
    for _ in 0..3 {
        let (to, message) = harness.next().await;
        let Outbound::Resolve { pointer: child, requester, .. } = message else {
            panic!("expected resolve, got {:?}", message);
        };
        assert_eq!(requester, me);
        children.push((to, child));
    }
    for (to, child) in &children {
        let name = child.last().unwrap().name.clone();
        harness
            .send(AssemblyEvent::Report {
                phase: Phase::INITIAL,
                pointer: child.clone(),
                assembly: Some(child_assembly(&name, *to)),
            })
            .await;
    }

    let (to, message) = harness.next().await;
    assert_eq!(to, master);
    let Outbound::Report { assembly: Some(assembly), .. } = message else {
        panic!("expected success report, got {:?}", message);
    };
    assert_eq!(assembly.instances.len(), 3);

    harness
        .send(AssemblyEvent::Release {
            phase: Phase::INITIAL,
            pointer: pointer.clone(),
        })
        .await;

    let mut released = Vec::new();
    for _ in 0..3 {
        let (_, message) = harness.next().await;
        let Outbound::Release { pointer: child, .. } = message else {
            panic!("expected release, got {:?}", message);
        };
        released.push(child);
    }
    released.sort();
    let mut expected: Vec<Pointer> = children.iter().map(|(_, p)| p.clone()).collect();
    expected.sort();
    assert_eq!(released, expected);

    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.bindings.len(), 3);
    assert!(snapshot
        .bindings
        .iter()
        .all(|(_, state)| *state == BindingState::Releasing));

    for child in &released[..2] {
        harness
            .send(AssemblyEvent::Report {
                phase: Phase::INITIAL,
                pointer: child.clone(),
                assembly: None,
            })
            .await;
    }
    harness.quiet().await;

    harness
        .send(AssemblyEvent::Report {
            phase: Phase::INITIAL,
            pointer: released[2].clone(),
            assembly: None,
        })
        .await;
    let (to, message) = harness.next().await;
    assert_eq!(to, master);
    assert!(matches!(message, Outbound::Report { assembly: None, .. }));
    assert!(harness.snapshot().await.requests.is_empty());
}

#[tokio::test]
async fn test_failed_child_moves_to_next_host_then_next_template() {
    let me = SystemId::new();
    let master = SystemId::new();
    let creator = ProviderId::new();
    let with_child = Contract::instance_template("api").with_child(Contract::instance_demand("a"));
    let leaf = Contract::instance_template("api");
    let container = StaticContainer::new().with_creator(creator, vec![with_child, leaf.clone()]);
    let mut harness = Harness::start(me, master, &[master], container);

    let pointer = Pointer::root("shop").instance("api");
    let child = pointer.instance("a");
    harness
        .send(AssemblyEvent::Resolve {
            phase: Phase::INITIAL,
            pointer: pointer.clone(),
            requester: master,
            contract: Contract::instance_demand("api"),
            reuse: false,
        })
        .await;

    let (first, message) = harness.next().await;
    assert!(matches!(message, Outbound::Resolve { ref pointer, .. } if *pointer == child));

    harness
        .send(AssemblyEvent::Report {
            phase: Phase::INITIAL,
            pointer: child.clone(),
            assembly: None,
        })
        .await;
    let (second, message) = harness.next().await;
    assert_ne!(first, second);
    assert!(matches!(message, Outbound::Resolve { ref pointer, reuse: false, .. } if *pointer == child));

    harness
        .send(AssemblyEvent::Report {
            phase: Phase::INITIAL,
            pointer: child.clone(),
            assembly: None,
        })
        .await;

    // Both hosts failed: the template with a child is abandoned for the leaf.
    let (to, message) = harness.next().await;
    assert_eq!(to, master);
    let Outbound::Report { assembly: Some(assembly), .. } = message else {
        panic!("expected success report, got {:?}", message);
    };
    assert_eq!(assembly.template, leaf);
    assert_eq!(assembly.creator_id, creator);
}

#[tokio::test]
async fn test_slave_adopts_newer_phase_and_drops_older() {
    let me = SystemId::new();
    let master = SystemId::new();
    let container = StaticContainer::new().with_creator(
        ProviderId::new(),
        vec![Contract::instance_template("api").with_child(Contract::instance_demand("a"))],
    );
    let mut harness = Harness::start(me, master, &[master], container);

    let pointer = Pointer::root("shop").instance("api");
    harness
        .send(AssemblyEvent::Resolve {
            phase: Phase::new(2),
            pointer: pointer.clone(),
            requester: master,
            contract: Contract::instance_demand("api"),
            reuse: false,
        })
        .await;
    let (_, message) = harness.next().await;
    assert!(matches!(message, Outbound::Resolve { phase, .. } if phase == Phase::new(2)));

    harness
        .send(AssemblyEvent::Release {
            phase: Phase::new(1),
            pointer: pointer.clone(),
        })
        .await;
    harness.quiet().await;

    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.phase, Phase::new(2));
    assert_eq!(snapshot.requests, vec![pointer.clone()]);
    assert_eq!(snapshot.bindings[0].1, BindingState::Resolving);

    // A newer phase abandons the request.
    harness
        .send(AssemblyEvent::Release {
            phase: Phase::new(3),
            pointer,
        })
        .await;
    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.phase, Phase::new(3));
    assert!(snapshot.requests.is_empty());
}

#[tokio::test]
async fn test_master_never_adopts_phase() {
    let me = SystemId::new();
    let mut harness = Harness::start(me, me, &[], StaticContainer::new());

    harness
        .send(AssemblyEvent::Release {
            phase: Phase::new(5),
            pointer: Pointer::root("shop"),
        })
        .await;
    assert_eq!(harness.snapshot().await.phase, Phase::INITIAL);
}

#[tokio::test]
async fn test_unreachable_child_host_restarts_root() {
    let me = SystemId::new();
    let other = SystemId::new();
    let spare = SystemId::new();
    let mut harness = Harness::start(me, me, &[other, spare], StaticContainer::new());

    let root = Pointer::root("shop");
    let mut state = root_state(
        ProviderId::new(),
        Contract::instance_template("shop").with_child(Contract::instance_demand("db")),
    );
    state.children.insert("db".to_string(), other);
    harness.setup(root.clone(), state).await;

    let (reply, mut rx) = oneshot::channel();
    harness.send(AssemblyEvent::Configure { reply }).await;

    // The recorded placement is tried first.
    let (to, message) = harness.next_remote().await;
    assert_eq!(to, other);
    assert!(matches!(
        message,
        Outbound::Resolve { phase, reuse: true, .. } if phase == Phase::new(1)
    ));

    harness.set_unreachable(other);
    harness
        .send(AssemblyEvent::Unreachable { system: other })
        .await;

    // One phase for the removal, one for the restarted root. The new
    // attempt ends up on the spare host.
    loop {
        let (to, message) = harness.next_remote().await;
        if to == spare
            && matches!(message, Outbound::Resolve { phase, .. } if phase == Phase::new(3))
        {
            break;
        }
    }

    // A late answer from the removed host must not complete the new attempt.
    harness
        .send(AssemblyEvent::Report {
            phase: Phase::new(1),
            pointer: root.instance("db"),
            assembly: Some(child_assembly("db", other)),
        })
        .await;

    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.systems.len(), 2);
    assert!(!snapshot.systems.contains(&other));
    assert_eq!(snapshot.phase, Phase::new(3));
    assert!(snapshot.configuring);
    assert_eq!(snapshot.requests, vec![root.clone()]);
    assert!(snapshot.completed.is_empty());
    assert_eq!(
        snapshot.bindings,
        vec![(root.instance("db"), BindingState::Resolving)]
    );
    assert!(rx.try_recv().is_err());

    harness
        .send(AssemblyEvent::Report {
            phase: Phase::new(3),
            pointer: root.instance("db"),
            assembly: Some(child_assembly("db", spare)),
        })
        .await;

    let assembly = harness.pump(rx).await.expect("root resolved on the spare host");
    assert_eq!(assembly.instances[0].system_id, spare);
    assert_eq!(harness.snapshot().await.completed, vec![root]);
}

#[tokio::test]
async fn test_master_broadcasts_removal_with_epoch() {
    let me = SystemId::new();
    let b = SystemId::new();
    let c = SystemId::new();
    let mut harness = Harness::start(me, me, &[b, c], StaticContainer::new());

    harness
        .send(AssemblyEvent::RemoveSystem {
            system: c,
            epoch: None,
        })
        .await;

    let mut sent = vec![harness.next().await, harness.next().await];
    sent.sort_by_key(|(to, _)| *to == c);
    assert_eq!(sent[0].0, b);
    assert!(matches!(
        sent[0].1,
        Outbound::RemoveSystem { system, epoch: Some(epoch) } if system == c && epoch == Phase::new(1)
    ));
    assert_eq!(sent[1].0, c);
    assert!(matches!(sent[1].1, Outbound::Remove));

    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.phase, Phase::new(1));
    assert_eq!(snapshot.systems.len(), 2);
}

#[tokio::test]
async fn test_slave_forwards_local_removal_to_master() {
    let me = SystemId::new();
    let master = SystemId::new();
    let other = SystemId::new();
    let mut harness = Harness::start(me, master, &[master, other], StaticContainer::new());

    harness
        .send(AssemblyEvent::Unreachable { system: other })
        .await;
    let (to, message) = harness.next().await;
    assert_eq!(to, master);
    assert!(matches!(
        message,
        Outbound::RemoveSystem { system, epoch: None } if system == other
    ));
    assert_eq!(harness.snapshot().await.phase, Phase::new(1));

    // The master's broadcast for the same removal does not advance again.
    harness
        .send(AssemblyEvent::RemoveSystem {
            system: other,
            epoch: Some(Phase::new(1)),
        })
        .await;
    assert_eq!(harness.snapshot().await.phase, Phase::new(1));

    // A higher epoch is adopted even for an unknown host.
    harness
        .send(AssemblyEvent::RemoveSystem {
            system: SystemId::new(),
            epoch: Some(Phase::new(4)),
        })
        .await;
    assert_eq!(harness.snapshot().await.phase, Phase::new(4));
}

#[tokio::test]
async fn test_slave_removed_from_application_stops() {
    let me = SystemId::new();
    let master = SystemId::new();
    let harness = Harness::start(me, master, &[master], StaticContainer::new());

    harness
        .send(AssemblyEvent::RemoveSystem {
            system: me,
            epoch: Some(Phase::new(1)),
        })
        .await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while !harness.handle.is_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("application did not stop");
}

#[tokio::test]
async fn test_setup_returns_recorded_children() {
    let me = SystemId::new();
    let other = SystemId::new();
    let mut harness = Harness::start(me, me, &[other], StaticContainer::new());

    let root = Pointer::root("shop");
    let mut state = AssemblyState::default();
    state.children.insert("db".to_string(), other);
    let answer = harness.setup(root.clone(), state).await;

    assert_eq!(answer.pointer, root);
    assert_eq!(answer.instances.len(), 1);
    assert_eq!(answer.instances[0].system_id, other);
}
