use ble_link_manager::domain::models::{
    AdvertisementData, ConnectionHandle, DeviceId, DeviceState, DisconnectReason, DiscoveryReport,
    ManagerEvent, OperationKind, PingOutcome, RadioEvent, ScanFilter,
};
use ble_link_manager::domain::settings::ManagerConfig;
use ble_link_manager::infrastructure::bluetooth::simulated::{
    RadioCall, SimulatedPeripheral, SimulatedRadio,
};
use ble_link_manager::infrastructure::bluetooth::{BleManager, Completion};
use ble_link_manager::ManagerError;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn id() -> DeviceId {
    DeviceId::from("AA:BB")
}

fn discovery(id: &DeviceId, rssi: i16) -> RadioEvent {
    RadioEvent::Discovered(DiscoveryReport {
        id: id.clone(),
        name: Some("LVS-Hush".into()),
        rssi,
        advertisement: AdvertisementData::default(),
    })
}

/// Manager over a radio that records requests but never answers them
fn manual_manager() -> (BleManager, Arc<SimulatedRadio>) {
    let (radio, _events) = SimulatedRadio::new();
    let manager = BleManager::new(radio.clone(), ManagerConfig::default());
    (manager, radio)
}

fn discovered(manager: &BleManager) {
    manager.start_scan(ScanFilter::default()).unwrap();
    manager.handle_event(discovery(&id(), -60));
}

fn connected(manager: &BleManager, handle: ConnectionHandle) {
    discovered(manager);
    manager.connect(&id()).unwrap();
    manager.handle_event(RadioEvent::ConnectResult {
        id: id(),
        result: Ok(handle),
    });
}

fn drain(events: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> Vec<ManagerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

// === Scenarios ===

#[tokio::test]
async fn test_discovery_lands_in_registry() {
    let (manager, _radio) = manual_manager();
    let mut events = manager.subscribe();

    manager.start_scan(ScanFilter::default()).unwrap();
    manager.handle_event(discovery(&id(), -60));

    let device = manager.device(&id()).unwrap();
    assert_eq!(device.state(), DeviceState::Discovered);
    assert_eq!(device.metadata.rssi, -60);

    assert_eq!(events.try_recv().unwrap(), ManagerEvent::ScanStarted);
    match events.try_recv().unwrap() {
        ManagerEvent::DeviceDiscovered { id: found, metadata } => {
            assert_eq!(found, id());
            assert_eq!(metadata.rssi, -60);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_connect_resolves_on_success() {
    let (manager, _radio) = manual_manager();
    discovered(&manager);

    let completion = manager.connect(&id()).unwrap();
    assert_eq!(manager.device(&id()).unwrap().state(), DeviceState::Connecting);

    manager.handle_event(RadioEvent::ConnectResult {
        id: id(),
        result: Ok(ConnectionHandle::new(4)),
    });
    assert_eq!(completion.wait().await, Ok(()));

    let device = manager.device(&id()).unwrap();
    assert_eq!(device.state(), DeviceState::Connected);
    assert_eq!(device.connection(), Some(ConnectionHandle::new(4)));
}

#[tokio::test]
async fn test_second_connect_rejected_first_unaffected() {
    let (manager, _radio) = manual_manager();
    discovered(&manager);

    let first = manager.connect(&id()).unwrap();
    let second = manager.connect(&id());
    assert!(matches!(
        second,
        Err(ManagerError::DuplicateOperation {
            kind: OperationKind::Connect,
            ..
        })
    ));

    manager.handle_event(RadioEvent::ConnectResult {
        id: id(),
        result: Ok(ConnectionHandle::new(1)),
    });
    assert_eq!(first.wait().await, Ok(()));
}

#[tokio::test]
async fn test_silent_device_is_lost() {
    let (manager, radio) = manual_manager();
    let t0 = Instant::now();
    connected(&manager, ConnectionHandle::new(2));
    let mut events = manager.subscribe();

    manager.heartbeat_tick_at(t0 + Duration::from_secs(6));
    assert!(radio
        .calls()
        .iter()
        .any(|call| matches!(call, RadioCall::Ping(..))));
    assert!(manager.device(&id()).unwrap().is_connected());

    manager.heartbeat_tick_at(t0 + Duration::from_secs(10));
    let device = manager.device(&id()).unwrap();
    assert_eq!(device.state(), DeviceState::Discovered);
    assert_eq!(device.connection(), None);
    assert!(drain(&mut events).contains(&ManagerEvent::ConnectionLost { id: id() }));
}

#[tokio::test]
async fn test_disconnect_from_discovered_is_invalid() {
    let (manager, _radio) = manual_manager();
    discovered(&manager);
    let before = manager.device(&id()).unwrap();

    assert!(matches!(
        manager.disconnect(&id()),
        Err(ManagerError::InvalidState {
            state: DeviceState::Discovered,
            ..
        })
    ));
    assert_eq!(manager.device(&id()).unwrap(), before);
    assert_eq!(manager.pending_count(), 0);
}

#[tokio::test]
async fn test_connect_times_out_and_late_success_is_released() {
    let (manager, radio) = manual_manager();
    discovered(&manager);
    let completion = manager.connect(&id()).unwrap();

    manager.sweep_timed_out_at(Instant::now() + Duration::from_secs(11));
    assert_eq!(
        completion.wait().await,
        Err(ManagerError::Timeout {
            id: id(),
            kind: OperationKind::Connect
        })
    );
    assert_eq!(manager.device(&id()).unwrap().state(), DeviceState::Discovered);
    assert!(radio.calls().contains(&RadioCall::CancelConnect(id())));

    // the radio answers after all
    manager.handle_event(RadioEvent::ConnectResult {
        id: id(),
        result: Ok(ConnectionHandle::new(8)),
    });
    assert_eq!(manager.device(&id()).unwrap().state(), DeviceState::Discovered);
    assert!(radio
        .calls()
        .contains(&RadioCall::Disconnect(id(), ConnectionHandle::new(8))));
}

#[tokio::test]
async fn test_clean_disconnect() {
    let (manager, _radio) = manual_manager();
    connected(&manager, ConnectionHandle::new(3));
    let mut events = manager.subscribe();

    let completion = manager.disconnect(&id()).unwrap();
    assert_eq!(
        manager.device(&id()).unwrap().state(),
        DeviceState::Disconnecting
    );

    manager.handle_event(RadioEvent::DisconnectResult {
        id: id(),
        result: Ok(()),
    });
    assert_eq!(completion.wait().await, Ok(()));
    assert_eq!(manager.device(&id()).unwrap().connection(), None);
    assert_eq!(
        drain(&mut events),
        vec![ManagerEvent::DeviceDisconnected {
            id: id(),
            reason: DisconnectReason::Requested
        }]
    );
    assert!(manager.auto_connect_ids().is_empty());
}

#[tokio::test]
async fn test_adapter_power_off_fails_pending() {
    let (manager, _radio) = manual_manager();
    discovered(&manager);
    let completion = manager.connect(&id()).unwrap();
    let mut events = manager.subscribe();

    manager.handle_event(RadioEvent::AdapterStateChanged { powered: false });
    assert!(matches!(
        completion.wait().await,
        Err(ManagerError::HardwareFailure(_))
    ));
    assert!(manager.devices().is_empty());
    assert!(!manager.is_scanning());

    let emitted = drain(&mut events);
    assert!(emitted.contains(&ManagerEvent::ScanStopped));
    assert!(emitted.contains(&ManagerEvent::AdapterStateChanged { powered: false }));
}

#[tokio::test]
async fn test_no_events_without_subscriber() {
    let (manager, _radio) = manual_manager();
    let events = manager.subscribe();
    drop(events);
    manager.unsubscribe();

    discovered(&manager);
    assert!(!manager.is_observing());

    // a subscriber attached later sees nothing from before
    let mut events = manager.subscribe();
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_run_loop_detects_silent_peripheral() {
    let (radio, radio_events) = SimulatedRadio::responsive();
    radio.add_peripheral(SimulatedPeripheral::new("AA:BB", "LVS-Hush", -60));
    let manager = BleManager::new(radio.clone(), ManagerConfig::default());
    let mut events = manager.subscribe();

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run(radio_events).await })
    };

    manager.start_scan(ScanFilter::default()).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            if let Some(ManagerEvent::DeviceDiscovered { .. }) = events.recv().await {
                break;
            }
        }
        manager.stop_scan();
        manager.connect(&id()).unwrap().wait().await.unwrap();

        radio.set_responsive(&id(), false);
        loop {
            if let Some(ManagerEvent::ConnectionLost { id: lost }) = events.recv().await {
                break lost;
            }
        }
    })
    .await;

    assert_eq!(outcome.unwrap(), id());
    assert_eq!(manager.device(&id()).unwrap().state(), DeviceState::Discovered);
    runner.abort();
}

#[tokio::test(start_paused = true)]
async fn test_known_device_reconnects_after_power_cycle() {
    let (radio, radio_events) = SimulatedRadio::responsive();
    radio.add_peripheral(SimulatedPeripheral::new("AA:BB", "LVS-Hush", -60));
    let config = ManagerConfig {
        known_device_ids: vec![id()],
        ..Default::default()
    };
    let manager = BleManager::new(radio.clone(), config);
    let mut events = manager.subscribe();
    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run(radio_events).await })
    };

    radio.set_powered(false);
    radio.set_powered(true);

    let reconnected = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(ManagerEvent::DeviceConnected { id: linked }) = events.recv().await {
                break linked;
            }
        }
    })
    .await;
    assert_eq!(reconnected.unwrap(), id());
    runner.abort();
}

// === Properties over random event sequences ===

const DEVICES: [&str; 2] = ["AA:BB", "CC:DD"];

#[derive(Debug, Clone)]
enum Step {
    Discover(usize),
    Connect(usize),
    Disconnect(usize),
    Write(usize),
    Forget(usize),
    ConnectOk(usize),
    ConnectErr(usize),
    DisconnectOk(usize),
    DisconnectErr(usize),
    Dropped(usize),
    WriteOk(usize),
    PingAlive(usize),
    PingFailed(usize),
    Advance(u64),
    AdapterOff,
    AdapterOn,
}

fn step() -> impl Strategy<Value = Step> {
    let dev = 0..DEVICES.len();
    prop_oneof![
        dev.clone().prop_map(Step::Discover),
        dev.clone().prop_map(Step::Connect),
        dev.clone().prop_map(Step::Disconnect),
        dev.clone().prop_map(Step::Write),
        dev.clone().prop_map(Step::Forget),
        dev.clone().prop_map(Step::ConnectOk),
        dev.clone().prop_map(Step::ConnectErr),
        dev.clone().prop_map(Step::DisconnectOk),
        dev.clone().prop_map(Step::DisconnectErr),
        dev.clone().prop_map(Step::Dropped),
        dev.clone().prop_map(Step::WriteOk),
        dev.clone().prop_map(Step::PingAlive),
        dev.prop_map(Step::PingFailed),
        (1u64..4_000).prop_map(Step::Advance),
        Just(Step::AdapterOff),
        Just(Step::AdapterOn),
    ]
}

proptest! {
    #[test]
    fn prop_handles_and_completions_stay_consistent(steps in prop::collection::vec(step(), 1..80)) {
        let (manager, _radio) = manual_manager();
        manager.start_scan(ScanFilter::default()).unwrap();

        let base = Instant::now();
        let mut elapsed = Duration::ZERO;
        let mut next_handle = 0u64;
        let mut completions: Vec<Completion> = Vec::new();

        for step in steps {
            let now = base + elapsed;
            let dev = |i: usize| DeviceId::from(DEVICES[i]);
            match step {
                Step::Discover(i) => manager.handle_event_at(discovery(&dev(i), -50), now),
                Step::Connect(i) => completions.extend(manager.connect(&dev(i)).ok()),
                Step::Disconnect(i) => completions.extend(manager.disconnect(&dev(i)).ok()),
                Step::Write(i) => completions.extend(manager.write(&dev(i), b"Battery;").ok()),
                Step::Forget(i) => {
                    let _ = manager.forget(&dev(i));
                }
                Step::ConnectOk(i) => {
                    next_handle += 1;
                    manager.handle_event_at(
                        RadioEvent::ConnectResult { id: dev(i), result: Ok(ConnectionHandle::new(next_handle)) },
                        now,
                    );
                }
                Step::ConnectErr(i) => manager.handle_event_at(
                    RadioEvent::ConnectResult { id: dev(i), result: Err("refused".into()) },
                    now,
                ),
                Step::DisconnectOk(i) => manager.handle_event_at(
                    RadioEvent::DisconnectResult { id: dev(i), result: Ok(()) },
                    now,
                ),
                Step::DisconnectErr(i) => manager.handle_event_at(
                    RadioEvent::DisconnectResult { id: dev(i), result: Err("busy".into()) },
                    now,
                ),
                Step::Dropped(i) => manager.handle_event_at(
                    RadioEvent::Disconnected { id: dev(i), reason: "supervision timeout".into() },
                    now,
                ),
                Step::WriteOk(i) => manager.handle_event_at(
                    RadioEvent::WriteResult { id: dev(i), result: Ok(()) },
                    now,
                ),
                Step::PingAlive(i) => manager.handle_event_at(
                    RadioEvent::PingResult { id: dev(i), outcome: PingOutcome::Alive(b"85;".to_vec()) },
                    now,
                ),
                Step::PingFailed(i) => manager.handle_event_at(
                    RadioEvent::PingResult { id: dev(i), outcome: PingOutcome::TimedOut },
                    now,
                ),
                Step::Advance(ms) => {
                    elapsed += Duration::from_millis(ms);
                    manager.heartbeat_tick_at(base + elapsed);
                    manager.sweep_timed_out_at(base + elapsed);
                }
                Step::AdapterOff => manager.handle_event_at(
                    RadioEvent::AdapterStateChanged { powered: false },
                    now,
                ),
                Step::AdapterOn => {
                    manager.handle_event_at(RadioEvent::AdapterStateChanged { powered: true }, now);
                    let _ = manager.start_scan(ScanFilter::default());
                }
            }

            for device in manager.devices() {
                prop_assert_eq!(
                    device.state() == DeviceState::Connected,
                    device.connection().is_some(),
                    "device {} in state {}", device.id, device.state()
                );
            }
        }

        // hardware goes silent; the sweep must settle everything still pending
        manager.sweep_timed_out_at(base + elapsed + Duration::from_secs(3600));
        prop_assert_eq!(manager.pending_count(), 0);
        for mut completion in completions {
            let result = completion.try_result();
            prop_assert!(result.is_some(), "{} never resolved", completion.token());
            prop_assert_ne!(result, Some(Err(ManagerError::Shutdown)));
        }
    }
}
