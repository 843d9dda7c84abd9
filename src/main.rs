use ble_link_manager::domain::models::{DeviceId, DisconnectReason, ManagerEvent};
use ble_link_manager::domain::settings::SettingsService;
use ble_link_manager::infrastructure::bluetooth::protocol::PeripheralCommand;
use ble_link_manager::infrastructure::bluetooth::simulated::{
    SimulatedPeripheral, SimulatedRadio,
};
use ble_link_manager::infrastructure::bluetooth::BleManager;
use ble_link_manager::infrastructure::logging;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Print manager events and remember which devices to reconnect to
async fn observe(mut events: mpsc::UnboundedReceiver<ManagerEvent>, mut settings: SettingsService) {
    while let Some(event) = events.recv().await {
        info!("Event: {:?}", event);
        let persisted = match &event {
            ManagerEvent::DeviceConnected { id } => settings.add_known_device(id),
            ManagerEvent::DeviceDisconnected {
                id,
                reason: DisconnectReason::Requested,
            } => settings.remove_known_device(id),
            _ => Ok(()),
        };
        if let Err(e) = persisted {
            warn!("Failed to save known devices: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;
    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting BLE Link Manager");

    let config = settings.get().manager_config();
    let filter = settings.get().scan_filter();

    let (radio, radio_events) = SimulatedRadio::responsive();
    radio.add_peripheral(SimulatedPeripheral::new("C4:7C:8D:6A:11:02", "LVS-Hush", -58));
    radio.add_peripheral(SimulatedPeripheral::new("E2:10:44:9B:3F:7A", "LVS-Edge", -74));

    let manager = BleManager::new(radio.clone(), config);
    let observer = tokio::spawn(observe(manager.subscribe(), settings));

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run(radio_events).await })
    };

    manager.start_scan(filter)?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.stop_scan();

    let devices = manager.devices();
    info!("Found {} device(s)", devices.len());
    let Some(target) = devices.first().map(|d| d.id.clone()) else {
        warn!("No devices found, nothing to do");
        return Ok(());
    };

    if let Err(e) = exercise(&manager, &target).await {
        error!("Session with {} failed: {}", target, e);
    }

    manager.unsubscribe();
    drop(radio);
    runner.abort();
    if let Err(e) = observer.await {
        warn!("Event observer task failed: {}", e);
    }
    info!("Done");
    Ok(())
}

async fn exercise(manager: &BleManager, id: &DeviceId) -> anyhow::Result<()> {
    manager.connect(id)?.wait().await?;
    info!("Connected to {}", id);

    manager
        .send_command(id, PeripheralCommand::Vibrate(10))?
        .wait()
        .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    manager
        .send_command(id, PeripheralCommand::Vibrate(0))?
        .wait()
        .await?;

    manager.disconnect(id)?.wait().await?;
    info!("Disconnected from {}", id);
    Ok(())
}
