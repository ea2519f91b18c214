//! The seam between the provisioning logic and a BLE central stack.
//!
//! [`crate::btle`] implements it on top of btleplug, [`crate::fake`] with a
//! scripted in-memory appliance.

use async_trait::async_trait;

use aquarisense_proto::Attribute;

use crate::ProvisioningError;

/// A peripheral seen while scanning. Only valid until the next scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Platform peripheral id (address on Linux, CoreBluetooth UUID on macOS),
    /// never the address alone since macOS reports it as all zeroes
    pub id: String,
    pub name: String,
    /// dBm
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    pub fn matches(&self, name_filter: &str) -> bool {
        self.name.to_lowercase().contains(&name_filter.to_lowercase())
    }
}

/// A BLE central
#[async_trait]
pub trait Radio: Send + Sync {
    type Link: Link + 'static;

    /// Resolves once the adapter can scan. Fails with
    /// [`ProvisioningError::ScanUnavailable`] if it never will.
    async fn wait_ready(&self) -> Result<(), ProvisioningError>;

    async fn start_scan(&self) -> Result<(), ProvisioningError>;

    async fn stop_scan(&self) -> Result<(), ProvisioningError>;

    /// Named peripherals discovered since the scan started. May repeat
    /// peripherals returned by earlier calls.
    async fn discovered(&self) -> Result<Vec<PeripheralHandle>, ProvisioningError>;

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Self::Link, ProvisioningError>;
}

/// An open GATT connection to one peripheral. Values crossing this trait are
/// in the base64 attribute envelope.
#[async_trait]
pub trait Link: Send + Sync {
    /// Resolves the AquariSense service and its characteristics
    async fn discover(&mut self) -> Result<(), ProvisioningError>;

    async fn read(&mut self, attribute: Attribute) -> Result<Vec<u8>, ProvisioningError>;

    async fn write(&mut self, attribute: Attribute, value: &[u8]) -> Result<(), ProvisioningError>;

    async fn disconnect(&mut self) -> Result<(), ProvisioningError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_filter_is_case_insensitive_substring() {
        let peripheral = PeripheralHandle {
            id: "P1".into(),
            name: "nimble [AquariSense-42]".into(),
            rssi: Some(-60),
        };
        assert!(peripheral.matches("aquarisense"));
        assert!(peripheral.matches("AQUARISENSE-4"));
        assert!(!peripheral.matches("kettle"));
    }
}
