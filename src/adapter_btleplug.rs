//! `GattAdapter` implementation over `btleplug`.
//!
//! Scans for a peripheral by name or address, connects, discovers its
//! characteristics, and routes notifications arriving on the shared
//! `btleplug` notification stream into per-characteristic queues so
//! `ControlPointService` and `ObjectWriter` can each await "the next
//! notification on the control-point characteristic" without racing each
//! other (they never do so concurrently — see the crate-level ordering
//! guarantees — but the queue still demultiplexes by characteristic so a
//! stray Buttonless notification can't be mistaken for a DFU response).

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic as BtleplugCharacteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::adapter::{Characteristic, GattAdapter};
use crate::error::DfuError;

/// Bytes written per GATT write call before the adapter falls back to
/// splitting it further. The protocol engine always hands the adapter
/// already-MTU-sized packets; this is a safety net for callers (e.g. the
/// control-point service, whose frames are always tiny) and for targets
/// that negotiate a smaller ATT MTU than expected.
const FALLBACK_WRITE_CHUNK: usize = 244;

async fn find_peripheral<P>(central: &Adapter, predicate: P) -> Result<Peripheral>
where
    P: Fn(&PeripheralProperties) -> bool,
{
    central.start_scan(ScanFilter::default()).await?;
    let mut events = central.events().await?;
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDiscovered(id) = event {
            let peripheral = central.peripheral(&id).await?;
            if let Some(properties) = peripheral.properties().await? {
                if predicate(&properties) {
                    central.stop_scan().await?;
                    return Ok(peripheral);
                }
            }
        }
    }
    Err(anyhow!("scanning stopped before a matching peripheral was found"))
}

#[cfg(not(target_os = "macos"))]
async fn find_peripheral_by_address(central: &Adapter, addr: BDAddr) -> Result<Peripheral> {
    log::info!("searching for {addr} by address...");
    find_peripheral(central, |props| props.address_type.is_some() && props.address == addr).await
}

#[cfg(target_os = "macos")]
async fn find_peripheral_by_address(_central: &Adapter, _addr: BDAddr) -> Result<Peripheral> {
    Err(anyhow!("BLE MAC addresses are not supported on macOS"))
}

async fn find_peripheral_by_name(central: &Adapter, name: &str) -> Result<Peripheral> {
    log::info!("searching for {name} by name...");
    find_peripheral(central, |props| props.local_name.as_deref() == Some(name)).await
}

/// A connected, characteristic-demultiplexed `btleplug` adapter.
pub struct BtleplugAdapter {
    peripheral: Peripheral,
    characteristics: HashMap<Characteristic, BtleplugCharacteristic>,
    queues: Mutex<HashMap<Characteristic, mpsc::UnboundedReceiver<Vec<u8>>>>,
    #[allow(dead_code)]
    _forwarder: JoinHandle<()>,
}

impl BtleplugAdapter {
    /// Scan for a peripheral by name or, where supported, BLE address,
    /// connect, discover services, and start routing notifications.
    pub async fn connect(target: &str) -> Result<Self> {
        let manager = btleplug::platform::Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .context("no local Bluetooth adapter found")?;

        let peripheral = match BDAddr::from_str(target) {
            Ok(addr) => find_peripheral_by_address(&central, addr).await?,
            Err(_) => find_peripheral_by_name(&central, target).await?,
        };

        peripheral.connect().await?;
        peripheral.discover_services().await?;

        let mut characteristics = HashMap::new();
        for known in [Characteristic::ControlPoint, Characteristic::Packet, Characteristic::Buttonless] {
            if let Some(found) = peripheral.characteristics().into_iter().find(|c| c.uuid == known.uuid()) {
                characteristics.insert(known, found);
            }
        }

        let mut senders = HashMap::new();
        let mut queues = HashMap::new();
        for known in characteristics.keys().copied() {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(known.uuid(), tx);
            queues.insert(known, rx);
        }

        let mut notifications = peripheral.notifications().await?;
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if let Some(tx) = senders.get(&notification.uuid) {
                    let _ = tx.send(notification.value);
                }
            }
        });

        Ok(Self {
            peripheral,
            characteristics,
            queues: Mutex::new(queues),
            _forwarder: forwarder,
        })
    }

    fn characteristic(&self, characteristic: Characteristic) -> Result<&BtleplugCharacteristic, DfuError> {
        self.characteristics
            .get(&characteristic)
            .ok_or_else(|| DfuError::Adapter(anyhow!("characteristic {characteristic:?} not found on peripheral")))
    }
}

impl GattAdapter for BtleplugAdapter {
    async fn write(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), DfuError> {
        let char = self.characteristic(characteristic)?;
        for chunk in data.chunks(FALLBACK_WRITE_CHUNK) {
            self.peripheral
                .write(char, chunk, WriteType::WithoutResponse)
                .await
                .map_err(|e| DfuError::Adapter(e.into()))?;
        }
        Ok(())
    }

    async fn enable_notifications(&self, characteristic: Characteristic) -> Result<(), DfuError> {
        let char = self.characteristic(characteristic)?.clone();
        self.peripheral
            .subscribe(&char)
            .await
            .map_err(|e| DfuError::NotificationStartError(e.to_string()))
    }

    async fn disable_notifications(&self, characteristic: Characteristic) -> Result<(), DfuError> {
        let char = self.characteristic(characteristic)?.clone();
        self.peripheral
            .unsubscribe(&char)
            .await
            .map_err(|e| DfuError::NotificationStopError(e.to_string()))
    }

    async fn next_notification(
        &self,
        characteristic: Characteristic,
        timeout: Duration,
    ) -> Result<Vec<u8>, DfuError> {
        let mut queues = self.queues.lock().await;
        let rx = queues
            .get_mut(&characteristic)
            .ok_or_else(|| DfuError::Adapter(anyhow!("characteristic {characteristic:?} not found on peripheral")))?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(DfuError::Adapter(anyhow!("notification stream for {characteristic:?} ended"))),
            Err(_) => Err(DfuError::NotificationTimeout),
        }
    }
}

/// Thin wrapper used by the CLI's `trigger` subcommand, which lives outside
/// the object-transfer protocol engine: write `[0x01]` to the Buttonless
/// characteristic and wait for its acknowledgement.
pub async fn trigger_buttonless_dfu(adapter: &BtleplugAdapter) -> Result<(), DfuError> {
    adapter.enable_notifications(Characteristic::Buttonless).await?;
    adapter.write(Characteristic::Buttonless, &[0x01]).await?;
    let response = adapter
        .next_notification(Characteristic::Buttonless, Duration::from_secs(5))
        .await?;
    if response == [0x20, 0x01, 0x01] {
        Ok(())
    } else {
        Err(DfuError::Adapter(anyhow!("buttonless DFU trigger failed: {response:?}")))
    }
}

