
use std::time::Duration;

use harness::{eventually, template, Cluster};
use plexus_assembler::{Peer, PeerError, StaticContainer};
use plexus_contract::Contract;
use plexus_id::{Phase, Pointer, ProviderId};

fn short_leases(config: &mut plexus_assembler::Config) {
    config.lease_duration = Duration::from_millis(300);
    config.lease_check_interval = Duration::from_millis(20);
}

#[tokio::test]
async fn unreachable_child_host_restarts_root_under_new_phase() {
    let root_creator = ProviderId::new();
    let alpha = StaticContainer::new()
        .with_creator(root_creator, vec![template("shop", &["db"])])
        .with_creator(ProviderId::new(), vec![Contract::instance_template("db")]);
    let beta = StaticContainer::new()
        .with_creator(ProviderId::new(), vec![Contract::instance_template("db")]);

    let cluster = Cluster::start(vec![alpha, beta]);
    cluster.prepare().await;
    // The hint pins db to beta, so the first attempt goes there.
    cluster
        .setup_root("shop", root_creator, template("shop", &["db"]), &[("db", 1)])
        .await;
    cluster.network.disconnect(cluster.system(1));

    let root = cluster.configure().await.expect("resolved without beta");
    assert_eq!(root.instances[0].system_id, cluster.system(0));

    let master = cluster.inspect(0).await;
    assert_eq!(master.systems, vec![cluster.system(0)]);
    // One phase for the first attempt, one for the removal, one for the
    // restarted root.
    assert_eq!(master.phase, Phase::new(3));

    let tree = cluster.tree("shop").await;
    assert_eq!(
        tree.find(&Pointer::root("shop").instance("db"))
            .map(|t| t.assembly.system_id),
        Some(cluster.system(0))
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn unreachable_host_at_prepare_is_excluded() {
    let cluster = Cluster::start(vec![StaticContainer::new(), StaticContainer::new()]);
    cluster.network.disconnect(cluster.system(1));
    cluster.prepare().await;

    let master = cluster.master().clone();
    let app = cluster.app;
    let mut systems = Vec::new();
    for _ in 0..50 {
        let snapshot = master.inspect(app).await.expect("inspect");
        systems = snapshot.systems;
        if systems.len() == 1 {
            assert_eq!(snapshot.phase, Phase::new(1));
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(systems, vec![cluster.system(0)]);
    assert!(cluster.hosts[1].applications().is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn remove_tears_down_every_participant() {
    let cluster = Cluster::start(vec![
        StaticContainer::new(),
        StaticContainer::new(),
        StaticContainer::new(),
    ]);
    cluster.prepare().await;
    for host in &cluster.hosts {
        assert_eq!(host.applications(), vec![cluster.app]);
    }

    cluster.master().remove(cluster.app).await.expect("remove");

    let hosts = cluster.hosts.clone();
    assert!(eventually(|| hosts.iter().all(|h| h.applications().is_empty())).await);

    let again = cluster.master().remove(cluster.app).await;
    assert!(matches!(again, Err(PeerError::UnknownApplication(_))));

    cluster.shutdown().await;
}

#[tokio::test]
async fn duplicate_prepare_is_rejected() {
    let cluster = Cluster::start(vec![StaticContainer::new(), StaticContainer::new()]);
    cluster.prepare().await;

    let second = cluster.master().prepare(cluster.app).await;
    assert!(matches!(second, Err(PeerError::Rejected(_))));
    assert_eq!(cluster.master().applications(), vec![cluster.app]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn expired_client_lease_removes_application() {
    let cluster = Cluster::with_config(
        vec![StaticContainer::new(), StaticContainer::new()],
        short_leases,
    );
    cluster.prepare().await;
    assert_eq!(cluster.hosts[1].applications(), vec![cluster.app]);

    // Nobody renews the lease handed back by prepare.
    let hosts = cluster.hosts.clone();
    assert!(eventually(|| hosts.iter().all(|h| h.applications().is_empty())).await);

    cluster.shutdown().await;
}

#[tokio::test]
async fn lost_slave_lease_removes_participant() {
    let cluster = Cluster::with_config(
        vec![StaticContainer::new(), StaticContainer::new()],
        short_leases,
    );
    let lease = cluster.prepare().await;

    let master = cluster.master().clone();
    let keeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(lease.duration / 3);
        loop {
            ticker.tick().await;
            if master.renew(lease.id).await.is_err() {
                break;
            }
        }
    });

    // Leases keep both sides alive while the link is up.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(cluster.inspect(0).await.systems.len(), 2);
    assert_eq!(cluster.hosts[1].applications(), vec![cluster.app]);

    cluster.network.disconnect(cluster.system(1));

    let slave = cluster.hosts[1].clone();
    assert!(eventually(|| slave.applications().is_empty()).await);

    let snapshot = cluster.inspect(0).await;
    assert_eq!(snapshot.systems, vec![cluster.system(0)]);
    assert!(snapshot.phase > Phase::INITIAL);

    keeper.abort();
    cluster.shutdown().await;
}
