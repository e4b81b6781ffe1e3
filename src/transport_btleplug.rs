//! btleplug-backed DFU transport.

use std::time::Duration;

use anyhow::anyhow;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use indicatif::ProgressBar;
use log::info;

use crate::error::DfuError;
use crate::transport::{DfuTransport, DfuTransportManager};

/// nRF DFU service & characteristic UUIDs
///
/// from [DFU BLE Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/group__nrf__dfu__ble.html)
/// and [Buttonless DFU Service](https://infocenter.nordicsemi.com/topic/sdk_nrf5_v17.1.0/service_dfu.html)
#[allow(dead_code)]
mod dfu_uuids {
    use uuid::Uuid;
    /// DFU Service (16 bit UUID 0xFE59)
    pub const SERVICE: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);
    /// Control Point Characteristic
    pub const CTRL_PT: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);
    /// Data Characteristic
    pub const DATA_PT: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU trigger without bonds Characteristic
    pub const BTTNLSS: Uuid = Uuid::from_u128(0x8EC90003_F315_4F60_9FB8_838830DAEA50);
    /// Buttonless DFU trigger with bonds Characteristic
    pub const BTTNLSS_WITH_BONDS: Uuid = Uuid::from_u128(0x8EC90004_F315_4F60_9FB8_838830DAEA50);
}

fn ble_err(err: btleplug::Error) -> DfuError {
    DfuError::Transport(err.into())
}

/// One scan result, addressable by its position in the sorted listing.
pub struct PeripheralInfo {
    id: PeripheralId,
    address: btleplug::api::BDAddr,
    name: Option<String>,
    rssi: Option<i16>,
}

impl std::fmt::Display for PeripheralInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rssi: {}, address: {}, name: {}",
            self.rssi.unwrap_or(-99),
            self.address,
            self.name.as_deref().unwrap_or("None")
        )
    }
}

pub struct BleManager {
    adapter: Adapter,
    scan_window: Duration,
}

impl BleManager {
    pub async fn new(scan_window: Duration) -> Result<Self, DfuError> {
        let manager = btleplug::platform::Manager::new().await.map_err(ble_err)?;
        let adapters = manager.adapters().await.map_err(ble_err)?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| DfuError::Transport(anyhow!("no Bluetooth adapter found")))?;
        Ok(BleManager { adapter, scan_window })
    }

    /// Scan for `scan_window`, then list everything in range, sorted by
    /// address so indices stay stable between invocations.
    pub async fn scan(&self) -> Result<Vec<PeripheralInfo>, DfuError> {
        let spinner = ProgressBar::new_spinner();
        spinner.enable_steady_tick(Duration::from_millis(64));
        spinner.set_message("scanning...");
        self.adapter.start_scan(ScanFilter::default()).await.map_err(ble_err)?;
        tokio::time::sleep(self.scan_window).await;
        self.adapter.stop_scan().await.map_err(ble_err)?;
        spinner.finish_and_clear();

        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(ble_err)? {
            if let Some(props) = peripheral.properties().await.map_err(ble_err)? {
                found.push(PeripheralInfo {
                    id: peripheral.id(),
                    address: props.address,
                    name: props.local_name,
                    rssi: props.rssi,
                });
            }
        }
        found.sort_by_key(|info| info.address);
        Ok(found)
    }
}

impl DfuTransportManager for BleManager {
    type Transport = BleTransport;

    async fn connect(&self, index: usize) -> Result<BleTransport, DfuError> {
        let found = self.scan().await?;
        let target = found.get(index).ok_or_else(|| {
            DfuError::Transport(anyhow!(
                "scan index {index} out of range ({} peripherals found)",
                found.len()
            ))
        })?;
        info!("connecting to {target}");

        let peripheral = self.adapter.peripheral(&target.id).await.map_err(ble_err)?;
        peripheral
            .connect()
            .await
            .map_err(|err| DfuError::Transport(anyhow!(err).context("failed to establish a connection")))?;
        peripheral
            .discover_services()
            .await
            .map_err(|err| DfuError::Transport(anyhow!(err).context("service discovery failed")))?;

        Ok(BleTransport { peripheral })
    }
}

fn characteristic(peripheral: &Peripheral, uuid: uuid::Uuid) -> Result<Characteristic, DfuError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| {
            DfuError::Transport(anyhow!(
                "characteristic {uuid} not found, is the device in DFU mode?"
            ))
        })
}

/// Connected peripheral. Characteristics are resolved per call; a device in
/// application mode only exposes the buttonless trigger, not the DFU points.
pub struct BleTransport {
    peripheral: Peripheral,
}

impl BleTransport {
    /// Kick a device running the application into DFU mode via the
    /// buttonless DFU service.
    pub async fn trigger_dfu(&self) -> Result<(), DfuError> {
        let trigger = characteristic(&self.peripheral, dfu_uuids::BTTNLSS)?;
        self.peripheral.subscribe(&trigger).await.map_err(ble_err)?;
        let mut notifications = self.peripheral.notifications().await.map_err(ble_err)?;
        self.peripheral
            .write(&trigger, &[0x01], WriteType::WithResponse)
            .await
            .map_err(ble_err)?;
        while let Some(ntf) = notifications.next().await {
            if ntf.uuid == trigger.uuid {
                if ntf.value == [0x20, 0x01, 0x01] {
                    return Ok(());
                }
                return Err(DfuError::Transport(anyhow!(
                    "unexpected DFU trigger response {:02x?}",
                    ntf.value
                )));
            }
        }
        Err(DfuError::Transport(anyhow!("notification stream ended during DFU trigger")))
    }
}

impl DfuTransport for BleTransport {
    async fn write_ctrl(&self, bytes: &[u8]) -> Result<(), DfuError> {
        let ctrl = characteristic(&self.peripheral, dfu_uuids::CTRL_PT)?;
        self.peripheral
            .write(&ctrl, bytes, WriteType::WithResponse)
            .await
            .map_err(ble_err)
    }

    async fn write_data(&self, bytes: &[u8]) -> Result<(), DfuError> {
        let data = characteristic(&self.peripheral, dfu_uuids::DATA_PT)?;
        self.peripheral
            .write(&data, bytes, WriteType::WithoutResponse)
            .await
            .map_err(ble_err)
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Vec<u8>>, DfuError> {
        let ctrl = characteristic(&self.peripheral, dfu_uuids::CTRL_PT)?;
        self.peripheral.subscribe(&ctrl).await.map_err(ble_err)?;
        let ctrl_uuid = ctrl.uuid;
        let stream = self.peripheral.notifications().await.map_err(ble_err)?;
        Ok(stream
            .filter_map(move |ntf| future::ready((ntf.uuid == ctrl_uuid).then_some(ntf.value)))
            .boxed())
    }
}
