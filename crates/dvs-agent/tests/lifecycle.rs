//! Lifecycle integration tests
//!
//! Network and port hooks, heartbeat and the notification channel, each
//! followed by a loop iteration to check the effect on reconciliation.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use dvs_agent::{
    AgentStatus, DvsRpcHandler, Notification, NotificationPump, PortStats, StateReporter,
    StateRpc,
};
use dvs_agent_common::{DvsError, Mutation, NetworkSegment};
use dvs_agent_test::{
    port, port_ids, vlan_network, AgentFixture, FakeStateRpc, SgCall, SwitchVerifier,
    TrackerVerifier,
};

// ============ Port booking ============

#[tokio::test]
async fn test_booked_port_promoted_exactly_once() {
    let fx = AgentFixture::new(&["physnet1:dvs1"], &["p1"]);
    let net = vlan_network("n1", "physnet1");
    let segment = NetworkSegment::vlan("physnet1", 100);
    fx.create_network(&net, &segment).await;
    let p1 = port("p1", "n1");

    let booking = fx
        .agent
        .book_port(&p1, &[segment.clone()], &net)
        .await
        .unwrap()
        .expect("segment matches");
    assert_eq!(booking.dvs_name, "dvs1");
    TrackerVerifier::new(fx.agent.tracker_snapshot())
        .assert_booked(&["p1"])
        .unwrap();

    fx.agent
        .update_port_postcommit(&p1, &p1, &segment)
        .await
        .unwrap();
    fx.agent
        .update_port_postcommit(&p1, &p1, &segment)
        .await
        .unwrap();

    let verifier = TrackerVerifier::new(fx.agent.tracker_snapshot());
    verifier.assert_booked(&[]).unwrap();
    verifier.assert_added(&["p1"]).unwrap();

    fx.agent.process_ports().await.unwrap();
    fx.agent
        .update_port_postcommit(&p1, &p1, &segment)
        .await
        .unwrap();
    let verifier = TrackerVerifier::new(fx.agent.tracker_snapshot());
    verifier.assert_known(&["p1"]).unwrap();
    verifier.assert_added(&[]).unwrap();
}

#[tokio::test]
async fn test_port_on_unmapped_network_is_invalid_system_state() {
    let fx = AgentFixture::new(&["physnet1:dvs1"], &[]);
    let net = vlan_network("n9", "physnet9");
    let segment = NetworkSegment::vlan("physnet9", 900);

    let err = fx
        .agent
        .book_port(&port("p1", "n9"), &[segment], &net)
        .await
        .unwrap_err();

    assert!(matches!(err, DvsError::InvalidSystemState { .. }));
    TrackerVerifier::new(fx.agent.tracker_snapshot())
        .assert_booked(&[])
        .unwrap();
}

#[tokio::test]
async fn test_admin_state_down_blocks_port() {
    let fx = AgentFixture::new(&["physnet1:dvs1"], &[]);
    let net = vlan_network("n1", "physnet1");
    let segment = NetworkSegment::vlan("physnet1", 100);
    fx.create_network(&net, &segment).await;
    let up = port("p1", "n1");
    fx.agent
        .book_port(&up, &[segment.clone()], &net)
        .await
        .unwrap();

    let down = up.clone().with_admin_state_up(false);
    fx.agent
        .update_port_postcommit(&down, &up, &segment)
        .await
        .unwrap();

    assert_eq!(fx.dvs("dvs1").port("p1").map(|p| p.blocked), Some(true));
}

// ============ Port and network deletion ============

#[tokio::test]
async fn test_release_is_idempotent() {
    let fx = AgentFixture::new(&["physnet1:dvs1"], &[]);
    let net = vlan_network("n1", "physnet1");
    let segment = NetworkSegment::vlan("physnet1", 100);
    fx.create_network(&net, &segment).await;
    let p1 = port("p1", "n1");
    fx.agent
        .book_port(&p1, &[segment.clone()], &net)
        .await
        .unwrap();
    let dvs = fx.dvs("dvs1");
    dvs.clear_mutations();

    fx.agent
        .delete_port_postcommit(&p1, &p1, &segment)
        .await
        .unwrap();
    fx.agent
        .delete_port_postcommit(&p1, &p1, &segment)
        .await
        .unwrap();

    SwitchVerifier::new(dvs).assert_port_absent("p1").unwrap();
    assert_eq!(dvs.mutations(), vec![Mutation::ReleasePort("p1".to_string())]);
}

#[tokio::test]
async fn test_network_delete_retries_while_ports_drain() {
    let fx = AgentFixture::new(&["physnet1:dvs1"], &[]);
    let net = vlan_network("n1", "physnet1");
    let segment = NetworkSegment::vlan("physnet1", 100);
    fx.create_network(&net, &segment).await;
    let dvs = fx.dvs("dvs1");
    dvs.inject_failure(DvsError::ResourceInUse {
        resource: "dvportgroup-1".to_string(),
    });

    fx.agent
        .delete_network_postcommit(&net, &segment)
        .await
        .unwrap();

    assert!(dvs.portgroup_for("n1").is_none());
}

#[tokio::test]
async fn test_network_hooks_ignore_unmapped_networks() {
    let fx = AgentFixture::new(&["physnet1:dvs1"], &[]);
    let net = vlan_network("n9", "physnet9");
    let segment = NetworkSegment::vlan("physnet9", 900);

    fx.agent
        .create_network_precommit(&net, &segment)
        .await
        .unwrap();
    fx.agent
        .delete_network_postcommit(&net, &segment)
        .await
        .unwrap();

    assert!(fx.dvs("dvs1").mutations().is_empty());
}

// ============ Heartbeat ============

#[tokio::test]
async fn test_revived_heartbeat_triggers_resync() {
    let fx = AgentFixture::new(&["physnet1:dvs1"], &[]);
    let mut daemon = fx.daemon();
    daemon.run_iteration().await;
    assert!(!fx.agent.needs_full_sync());

    // A VM plugged in while the control plane considered the agent dead.
    fx.dvs("dvs1").add_port("p1", "dvportgroup-1", true);

    let state_rpc = Arc::new(FakeStateRpc::scripted(vec![
        Err(DvsError::rpc("report_state", "timeout")),
        Ok(AgentStatus::Revived),
    ]));
    let mut reporter =
        StateReporter::new(fx.agent.clone(), Arc::clone(&state_rpc) as Arc<dyn StateRpc>)
            .unwrap();

    reporter.report_state().await;
    assert!(!fx.agent.needs_full_sync());
    reporter.report_state().await;
    assert!(fx.agent.needs_full_sync());

    let reports = state_rpc.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].start_flag, Some(true));
    assert_eq!(reports[1].start_flag, Some(true));
    assert_eq!(reporter.state().start_flag, None);

    let report = daemon.run_iteration().await;
    assert!(report.full_synced);
    TrackerVerifier::new(fx.agent.tracker_snapshot())
        .assert_known(&["p1"])
        .unwrap();
}

// ============ Notifications ============

#[tokio::test]
async fn test_notifications_drive_next_cycle() {
    let fx = AgentFixture::new(&["physnet1:dvs1"], &[]);
    fx.seed_known(&["p1", "p2"]);
    let (tx, pump) = NotificationPump::spawn(fx.agent.clone());

    tx.send(Notification::PortUpdate(port("p1", "n1")))
        .await
        .unwrap();
    tx.send(Notification::PortDelete {
        port_id: "p2".to_string(),
    })
    .await
    .unwrap();
    tx.send(Notification::NetworkDelete {
        network_id: "n1".to_string(),
    })
    .await
    .unwrap();
    drop(tx);
    assert_eq!(pump.shutdown(Duration::from_secs(1)).await, Some(3));

    let stats = fx.agent.process_ports().await.unwrap();

    assert_eq!(
        stats,
        PortStats {
            added: 0,
            updated: 1,
            removed: 1
        }
    );
    assert_eq!(
        fx.sg.calls(),
        vec![
            SgCall::Remove(port_ids(&["p2"])),
            SgCall::Setup {
                new: port_ids(&[]),
                updated: port_ids(&["p1"]),
            },
        ]
    );
    TrackerVerifier::new(fx.agent.tracker_snapshot())
        .assert_known(&["p1"])
        .unwrap();
}

#[tokio::test]
async fn test_security_group_notification_requests_refresh() {
    let mut config = dvs_agent_test::test_config("compute-1", &["physnet1:dvs1"]);
    config.agent.minimize_polling = true;
    let fx = AgentFixture::with_config(config, &[]);
    let mut daemon = fx.daemon();
    daemon.run_iteration().await;
    fx.sg.clear();

    fx.agent
        .handle_notification(Notification::SecurityGroupRuleUpdated(vec!["sg1".to_string()]));

    assert!(daemon.run_iteration().await.port_stats.is_some());
    assert_eq!(fx.sg.calls().len(), 1);
    assert!(daemon.run_iteration().await.port_stats.is_none());
}
