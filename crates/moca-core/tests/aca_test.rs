#![allow(clippy::unwrap_used)]
// Integration tests for ACA sessions against the simulated gateway.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;

use moca_core::sim::SimGateway;
use moca_core::{
    AcaConfig, AcaFailure, AcaState, AssociatedDevice, ControllerConfig, CoreError, DriverGateway,
    IfIndex, InterfaceManager, InvalidArgument, MacAddress, NodeId, ProbeType,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn setup_with(config: ControllerConfig) -> (Arc<SimGateway>, InterfaceManager) {
    let sim = Arc::new(SimGateway::new());
    let manager = InterfaceManager::new(
        IfIndex::SINGLE,
        Arc::clone(&sim) as Arc<dyn DriverGateway>,
        config,
    );
    (sim, manager)
}

/// Background polling is pushed out of the way so tests drive it by hand.
fn setup() -> (Arc<SimGateway>, InterfaceManager) {
    setup_with(ControllerConfig {
        aca_poll_interval: Duration::from_secs(3600),
        ..ControllerConfig::default()
    })
}

fn scenario_config() -> AcaConfig {
    AcaConfig::new(NodeId::new(2).unwrap(), ProbeType::Evm, 5, 0x0005)
}

fn device(last_octet: u8, node: u32) -> AssociatedDevice {
    AssociatedDevice::new(
        MacAddress::from_octets([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last_octet]),
        NodeId::new(node).unwrap(),
    )
}

async fn wait_for_state(manager: &InterfaceManager, wanted: impl Fn(&AcaState) -> bool) {
    let mut rx = manager.aca_subscribe();
    tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| wanted(&s.state)))
        .await
        .expect("state not reached in time")
        .unwrap();
}

// ── Validation ──────────────────────────────────────────────────────

#[test]
fn test_raw_config_validation() {
    assert_eq!(
        AcaConfig::from_raw(16, 1, 5, 0).unwrap_err(),
        InvalidArgument::NodeId(16)
    );
    assert_eq!(
        AcaConfig::from_raw(2, 2, 5, 0).unwrap_err(),
        InvalidArgument::ProbeType(2)
    );
}

#[tokio::test]
async fn test_unsupported_channel_rejected_before_gateway() {
    let (sim, manager) = setup();
    let mut config = scenario_config();
    config.channel = 99;

    let result = manager.aca_start(config).await;
    assert!(
        matches!(
            result,
            Err(CoreError::InvalidArgument(InvalidArgument::Channel { channel: 99, min: 0, max: 63 }))
        ),
        "got {result:?}"
    );
    assert_eq!(sim.aca_start_calls(IfIndex::SINGLE), 0);
    assert_eq!(manager.aca_status().state, AcaState::Idle);
}

// ── Single flight ───────────────────────────────────────────────────

#[tokio::test]
async fn test_second_start_while_configuring_is_refused() {
    let (sim, manager) = setup();
    sim.hold_aca_ack(IfIndex::SINGLE);

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.aca_start(scenario_config()).await }
    });
    wait_for_state(&manager, |s| *s == AcaState::Configuring).await;

    let second = manager.aca_start(scenario_config()).await;
    assert_eq!(second, Err(CoreError::AlreadyInProgress));
    // The refused call never reached hardware.
    assert_eq!(sim.aca_start_calls(IfIndex::SINGLE), 1);

    sim.release_aca_ack(IfIndex::SINGLE);
    first.await.unwrap().unwrap();
    assert_eq!(manager.aca_status().state, AcaState::Running);

    assert_eq!(
        manager.aca_start(scenario_config()).await,
        Err(CoreError::AlreadyInProgress)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_admit_exactly_one() {
    let (sim, manager) = setup();
    sim.hold_aca_ack(IfIndex::SINGLE);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.aca_start(scenario_config()).await })
        })
        .collect();

    wait_for_state(&manager, |s| *s == AcaState::Configuring).await;
    // Give the losers time to reach the writer check.
    tokio::time::sleep(Duration::from_millis(50)).await;
    sim.release_aca_ack(IfIndex::SINGLE);

    let mut accepted = 0;
    let mut refused = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => accepted += 1,
            Err(CoreError::AlreadyInProgress) => refused += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!((accepted, refused), (1, 7));
    assert_eq!(manager.aca_status().session, 1);
}

#[tokio::test]
async fn test_start_refused_while_config_is_written() {
    let (sim, manager) = setup();
    sim.hold_aca_ack(IfIndex::SINGLE);
    let mut configure = scenario_config();
    configure.start = false;
    configure.channel = 7;

    let write = tokio::spawn({
        let manager = manager.clone();
        async move { manager.aca_start(configure).await }
    });
    tokio::time::timeout(Duration::from_secs(5), async {
        while sim.aca_start_calls(IfIndex::SINGLE) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("config write never reached the gateway");

    assert_eq!(
        manager.aca_start(scenario_config()).await,
        Err(CoreError::AlreadyInProgress)
    );
    assert_eq!(sim.aca_start_calls(IfIndex::SINGLE), 1);
    assert_eq!(manager.aca_status().state, AcaState::Idle);

    sim.release_aca_ack(IfIndex::SINGLE);
    write.await.unwrap().unwrap();
    // The config write is recorded, not dropped.
    let status = manager.aca_status();
    assert_eq!(status.config, Some(configure));
    assert_eq!(status.session, 0);

    manager.aca_start(scenario_config()).await.unwrap();
    let status = manager.aca_status();
    assert_eq!(status.state, AcaState::Running);
    assert_eq!(status.session, 1);
}

// ── Cancel ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let (sim, manager) = setup();
    manager.aca_start(scenario_config()).await.unwrap();

    let (a, b) = tokio::join!(manager.aca_cancel(), manager.aca_cancel());
    a.unwrap();
    b.unwrap();
    manager.aca_cancel().await.unwrap();

    assert_eq!(manager.aca_status().state, AcaState::Cancelled);
    assert_eq!(sim.aca_cancel_calls(IfIndex::SINGLE), 1);
    assert!(!sim.aca_running(IfIndex::SINGLE));
}

#[tokio::test]
async fn test_late_ack_after_cancel_is_discarded() {
    let (sim, manager) = setup();
    sim.hold_aca_ack(IfIndex::SINGLE);

    let start = tokio::spawn({
        let manager = manager.clone();
        async move { manager.aca_start(scenario_config()).await }
    });
    wait_for_state(&manager, |s| *s == AcaState::Configuring).await;

    manager.aca_cancel().await.unwrap();
    assert_eq!(manager.aca_status().state, AcaState::Cancelled);

    sim.release_aca_ack(IfIndex::SINGLE);
    start.await.unwrap().unwrap();

    let status = manager.aca_status();
    assert_eq!(status.state, AcaState::Cancelled);
    assert_eq!(status.session, 1);
    assert!(!status.trap_completed);

    // A fresh session is accepted afterwards.
    manager.aca_start(scenario_config()).await.unwrap();
    let status = manager.aca_status();
    assert_eq!(status.state, AcaState::Running);
    assert_eq!(status.session, 2);
}

#[tokio::test(start_paused = true)]
async fn test_abort_timeout_still_cancels() {
    let (sim, manager) = setup();
    manager.aca_start(scenario_config()).await.unwrap();
    sim.stall_aca_abort(IfIndex::SINGLE, true);

    manager.aca_cancel().await.unwrap();
    assert_eq!(manager.aca_status().state, AcaState::Cancelled);
}

// ── Timeouts ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_start_times_out() {
    let (sim, manager) = setup();
    sim.hold_aca_ack(IfIndex::SINGLE);

    let result = manager.aca_start(scenario_config()).await;
    assert!(
        matches!(result, Err(CoreError::Timeout { operation: "start_aca", .. })),
        "got {result:?}"
    );
    assert_eq!(
        manager.aca_status().state,
        AcaState::Failed(AcaFailure::Timeout)
    );

    // The hardware was told to abort, so a restart is not refused by it.
    assert_eq!(sim.aca_cancel_calls(IfIndex::SINGLE), 1);
    assert!(!sim.aca_running(IfIndex::SINGLE));

    sim.release_aca_ack(IfIndex::SINGLE);
    manager.aca_start(scenario_config()).await.unwrap();
    let status = manager.aca_status();
    assert_eq!(status.state, AcaState::Running);
    assert_eq!(status.session, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_start_fails_even_if_abort_stalls() {
    let (sim, manager) = setup();
    sim.hold_aca_ack(IfIndex::SINGLE);
    sim.stall_aca_abort(IfIndex::SINGLE, true);

    let result = manager.aca_start(scenario_config()).await;
    assert!(matches!(result, Err(CoreError::Timeout { .. })), "got {result:?}");
    assert_eq!(
        manager.aca_status().state,
        AcaState::Failed(AcaFailure::Timeout)
    );
    assert_eq!(sim.aca_cancel_calls(IfIndex::SINGLE), 1);
}

#[tokio::test(start_paused = true)]
async fn test_running_session_fails_after_deadline() {
    let (sim, manager) = setup_with(ControllerConfig {
        aca_poll_interval: Duration::from_millis(100),
        aca_deadline: Duration::from_secs(2),
        ..ControllerConfig::default()
    });
    manager.aca_start(scenario_config()).await.unwrap();

    wait_for_state(&manager, AcaState::is_terminal).await;
    assert_eq!(
        manager.aca_status().state,
        AcaState::Failed(AcaFailure::Timeout)
    );
    assert_eq!(sim.aca_cancel_calls(IfIndex::SINGLE), 1);
    assert!(!sim.aca_running(IfIndex::SINGLE));

    manager.aca_start(scenario_config()).await.unwrap();
    let status = manager.aca_status();
    assert_eq!(status.state, AcaState::Running);
    assert_eq!(status.session, 2);
}

#[tokio::test(start_paused = true)]
async fn test_poll_failures_exhaust_budget() {
    let (sim, manager) = setup_with(ControllerConfig {
        aca_poll_interval: Duration::from_millis(100),
        aca_poll_retries: 2,
        ..ControllerConfig::default()
    });
    manager.aca_start(scenario_config()).await.unwrap();
    sim.fail_aca_polls(IfIndex::SINGLE, 10);

    wait_for_state(&manager, AcaState::is_terminal).await;
    assert!(matches!(
        manager.aca_status().state,
        AcaState::Failed(AcaFailure::Driver(_))
    ));
    assert_eq!(sim.aca_cancel_calls(IfIndex::SINGLE), 1);
    assert!(!sim.aca_running(IfIndex::SINGLE));
}

// ── End to end ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_evm_assessment_on_channel_5() {
    let (sim, manager) = setup();
    for (octet, node) in [(0x00, 0), (0x01, 1), (0x02, 2)] {
        sim.add_device(IfIndex::SINGLE, device(octet, node));
    }

    manager.aca_start(scenario_config()).await.unwrap();
    let status = manager.aca_status();
    assert_eq!(status.state, AcaState::Running);
    assert_eq!(manager.aca_config(), Some(scenario_config()));

    assert!(matches!(
        manager.aca_subcarrier_stats().await,
        Err(CoreError::NotReady { .. })
    ));

    sim.complete_aca(IfIndex::SINGLE, -31);
    assert_eq!(manager.aca_poll().await.unwrap(), AcaState::Completed);

    let status = manager.aca_status();
    assert!(status.result_ready());
    assert_eq!(status.rx_power, -31);
    assert_eq!(status.power_profile.len(), 512);

    let rows = manager.aca_subcarrier_stats().await.unwrap();
    let pairs: Vec<(u8, u8, u32)> = rows
        .iter()
        .map(|r| (r.tx_node.get(), r.rx_node.get(), r.channel))
        .collect();
    // Mask 0x0005 selects nodes 0 and 2; node 2 is the prober.
    assert_eq!(pairs, vec![(0, 2, 5), (2, 0, 5)]);
    for row in &rows {
        assert_eq!(row.modulation.len(), 512);
        assert_eq!(row.nper.len(), 512);
        assert_eq!(row.vlper.len(), 512);
    }
}

#[tokio::test(start_paused = true)]
async fn test_background_poller_completes_session() {
    let (sim, manager) = setup_with(ControllerConfig {
        aca_poll_interval: Duration::from_millis(100),
        ..ControllerConfig::default()
    });
    manager.aca_start(scenario_config()).await.unwrap();
    sim.complete_aca(IfIndex::SINGLE, -20);

    wait_for_state(&manager, |s| *s == AcaState::Completed).await;
    assert!(manager.aca_status().result_ready());
}

#[tokio::test]
async fn test_incomplete_subcarrier_rows_are_internal_errors() {
    let (sim, manager) = setup();
    manager.aca_start(scenario_config()).await.unwrap();
    sim.complete_aca(IfIndex::SINGLE, -10);
    manager.aca_poll().await.unwrap();

    let mut rows = manager.aca_subcarrier_stats().await.unwrap();
    rows[0].nper = moca_core::SubcarrierProfile::empty();
    sim.set_scmod_stats(IfIndex::SINGLE, rows);

    assert!(matches!(
        manager.aca_subcarrier_stats().await,
        Err(CoreError::Internal(_))
    ));
}

// ── Snapshot consistency ────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_never_mixes_sessions() {
    let (sim, manager) = setup();
    let done = Arc::new(AtomicBool::new(false));

    let reader = tokio::spawn({
        let manager = manager.clone();
        let done = Arc::clone(&done);
        async move {
            let mut reads = 0u64;
            while !done.load(Ordering::Relaxed) {
                let status = manager.aca_status();
                let completed = status.state == AcaState::Completed;
                assert_eq!(status.trap_completed, completed, "{status:?}");
                assert_eq!(status.power_profile.is_empty(), !completed, "{status:?}");
                if completed {
                    assert!(status.power_profile.iter().all(|p| *p == status.rx_power));
                }
                reads += 1;
                tokio::task::yield_now().await;
            }
            reads
        }
    });

    for i in 0..200 {
        manager.aca_start(scenario_config()).await.unwrap();
        sim.complete_aca(IfIndex::SINGLE, -i);
        assert_eq!(manager.aca_poll().await.unwrap(), AcaState::Completed);
    }
    done.store(true, Ordering::Relaxed);

    let reads = reader.await.unwrap();
    assert!(reads > 0);
    assert_eq!(manager.aca_status().session, 200);
}
