//! [`Radio`] and [`Link`] over the platform BLE stack via btleplug.
//!
//! On the air the AquariSense characteristics carry plain UTF-8 JSON. The
//! rest of the controller speaks the base64 envelope, so values are wrapped
//! on read and unwrapped on write here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralState, Characteristic, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use data_encoding::BASE64;
use log::debug;
use uuid::Uuid;

use aquarisense_proto::Attribute;
use aquarisense_proto::ble::SERVICE_UUID;

use crate::{Link, PeripheralHandle, ProvisioningError, Radio};

/// How long the adapter may take to report whether it is powered on
const READY_TIMEOUT: Duration = Duration::from_secs(10);

fn parse_uuid(s: &str) -> Result<Uuid, ProvisioningError> {
    Uuid::parse_str(s).map_err(|e| ProvisioningError::DiscoveryFailed(format!("invalid uuid {s}: {e}")))
}

/// `Some` once the adapter has settled into a usable or unusable state
fn readiness(state: CentralState) -> Option<Result<(), ProvisioningError>> {
    match state {
        CentralState::PoweredOn => Some(Ok(())),
        CentralState::PoweredOff => {
            Some(Err(ProvisioningError::ScanUnavailable("Bluetooth is powered off".to_string())))
        }
        _ => None,
    }
}

/// Handle for a discovered peripheral. `id` is the platform peripheral id,
/// unique per peripheral on every platform, unlike the address which macOS
/// reports as all zeroes.
fn handle(id: String, props: PeripheralProperties) -> Option<PeripheralHandle> {
    // unnamed peripherals can never match the name filter
    let name = props.local_name?;
    Some(PeripheralHandle { id, name, rssi: props.rssi })
}

/// The first Bluetooth adapter of the host
#[derive(Clone)]
pub struct BtleRadio {
    adapter: Adapter,
}

impl BtleRadio {
    pub async fn new() -> Result<Self, ProvisioningError> {
        let unavailable = |e: btleplug::Error| ProvisioningError::ScanUnavailable(e.to_string());
        let manager = Manager::new().await.map_err(unavailable)?;
        let adapters = manager.adapters().await.map_err(unavailable)?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| ProvisioningError::ScanUnavailable("no Bluetooth adapter found".to_string()))?;
        Ok(Self { adapter })
    }

    async fn find(&self, id: &str) -> Result<Peripheral, ProvisioningError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| ProvisioningError::ConnectionFailed(e.to_string()))?;
        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| ProvisioningError::ConnectionFailed(format!("{id} is no longer in range")))
    }
}

#[async_trait]
impl Radio for BtleRadio {
    type Link = BtleLink;

    async fn wait_ready(&self) -> Result<(), ProvisioningError> {
        let unavailable = |e: btleplug::Error| ProvisioningError::ScanUnavailable(e.to_string());
        let info = self.adapter.adapter_info().await.map_err(unavailable)?;
        debug!("using adapter {info}");

        let settled = tokio::time::timeout(READY_TIMEOUT, async {
            loop {
                let state = self.adapter.adapter_state().await.map_err(unavailable)?;
                if let Some(ready) = readiness(state) {
                    return ready;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
        .await;
        settled.unwrap_or_else(|_| {
            Err(ProvisioningError::ScanUnavailable(format!(
                "adapter did not power on within {READY_TIMEOUT:?}"
            )))
        })
    }

    async fn start_scan(&self) -> Result<(), ProvisioningError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| ProvisioningError::ScanUnavailable(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), ProvisioningError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| ProvisioningError::ScanUnavailable(e.to_string()))
    }

    async fn discovered(&self) -> Result<Vec<PeripheralHandle>, ProvisioningError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| ProvisioningError::ScanUnavailable(e.to_string()))?;

        let mut handles = Vec::new();
        for peripheral in peripherals {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            handles.extend(handle(peripheral.id().to_string(), props));
        }
        Ok(handles)
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<BtleLink, ProvisioningError> {
        let peripheral = self.find(&handle.id).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| ProvisioningError::ConnectionFailed(e.to_string()))?;
        Ok(BtleLink { peripheral, characteristics: HashMap::new() })
    }
}

pub struct BtleLink {
    peripheral: Peripheral,
    characteristics: HashMap<Attribute, Characteristic>,
}

impl BtleLink {
    fn characteristic(&self, attribute: Attribute) -> Result<&Characteristic, ProvisioningError> {
        self.characteristics.get(&attribute).ok_or(ProvisioningError::NotReady)
    }
}

#[async_trait]
impl Link for BtleLink {
    async fn discover(&mut self) -> Result<(), ProvisioningError> {
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| ProvisioningError::DiscoveryFailed(e.to_string()))?;

        let service = parse_uuid(SERVICE_UUID)?;
        let characteristics = self.peripheral.characteristics();
        let mut found = HashMap::new();
        for attribute in Attribute::ALL {
            let uuid = parse_uuid(attribute.uuid())?;
            let characteristic = characteristics
                .iter()
                .find(|c| c.service_uuid == service && c.uuid == uuid)
                .ok_or_else(|| ProvisioningError::DiscoveryFailed(format!("{attribute} characteristic not found")))?;
            found.insert(attribute, characteristic.clone());
        }
        self.characteristics = found;
        Ok(())
    }

    async fn read(&mut self, attribute: Attribute) -> Result<Vec<u8>, ProvisioningError> {
        let characteristic = self.characteristic(attribute)?;
        let raw = self
            .peripheral
            .read(characteristic)
            .await
            .map_err(|e| ProvisioningError::ReadFailed { attribute, reason: e.to_string() })?;
        Ok(BASE64.encode(&raw).into_bytes())
    }

    async fn write(&mut self, attribute: Attribute, value: &[u8]) -> Result<(), ProvisioningError> {
        let characteristic = self.characteristic(attribute)?;
        let raw = BASE64
            .decode(value)
            .map_err(|e| ProvisioningError::WriteFailed { attribute, reason: format!("bad envelope: {e}") })?;
        self.peripheral
            .write(characteristic, &raw, WriteType::WithResponse)
            .await
            .map_err(|e| ProvisioningError::WriteFailed { attribute, reason: e.to_string() })
    }

    async fn disconnect(&mut self) -> Result<(), ProvisioningError> {
        self.characteristics.clear();
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| ProvisioningError::ConnectionFailed(e.to_string()))
    }
}
