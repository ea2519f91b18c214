//! BLE GATT Service Protocol Constants for AquariSense Device Provisioning
//!
//! These UUIDs are the same on every AquariSense unit. They identify the
//! protocol, not an individual device: a device is told apart by its
//! Bluetooth address and the id read from the identity characteristic.

/// Main service UUID
pub const SERVICE_UUID: &str = "67fdd12e-9cd6-44b7-8be9-c2570df58644";

/// Device identity Characteristic UUID (read): `{ "id": "AQS-EU-M01-25-000001" }`
pub const DEVICE_ID_UUID: &str = "38020776-89ec-4de7-ae14-89c6e988f720";

/// Device name Characteristic UUID (read/write)
///
/// Read: `{ "id": ..., "name": "Living Room Tank" }`, write: `{ "name": ... }`
pub const DEVICE_NAME_UUID: &str = "2c7f018a-ad6f-4d01-89bb-ec0259a70587";

/// WiFi networks Characteristic UUID (read): `[{ "ssid", "signal", "secure" }, ...]`
pub const WIFI_NETWORKS_UUID: &str = "cdad060e-80fb-4958-921d-0fd896a4eac6";

/// WiFi credentials Characteristic UUID (write): `{ "ssid", "password" }`
pub const WIFI_CREDENTIALS_UUID: &str = "9f330499-a7d3-49d3-9243-7f9d09f7d37d";

/// WiFi status Characteristic UUID (read)
///
/// `{ "status": "idle" | "connecting" | "connected" | "failed" | "disconnected", "ssid"?, "ip"? }`
pub const WIFI_STATUS_UUID: &str = "1605ae78-0793-4cab-90d1-32290901e0c2";

/// Name fragment every AquariSense advertises, matched case-insensitively
pub const ADVERTISED_NAME: &str = "aquarisense";

/// Characteristics of the AquariSense service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
    DeviceIdentity,
    DeviceName,
    NetworkList,
    Credentials,
    NetworkStatus,
}

impl Attribute {
    pub const ALL: [Attribute; 5] = [
        Attribute::DeviceIdentity,
        Attribute::DeviceName,
        Attribute::NetworkList,
        Attribute::Credentials,
        Attribute::NetworkStatus,
    ];

    pub fn uuid(&self) -> &'static str {
        match self {
            Attribute::DeviceIdentity => DEVICE_ID_UUID,
            Attribute::DeviceName => DEVICE_NAME_UUID,
            Attribute::NetworkList => WIFI_NETWORKS_UUID,
            Attribute::Credentials => WIFI_CREDENTIALS_UUID,
            Attribute::NetworkStatus => WIFI_STATUS_UUID,
        }
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self, Attribute::Credentials)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Attribute::DeviceName | Attribute::Credentials)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Attribute::DeviceIdentity => "device-identity",
            Attribute::DeviceName => "device-name",
            Attribute::NetworkList => "network-list",
            Attribute::Credentials => "credentials",
            Attribute::NetworkStatus => "network-status",
        }
    }
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_are_distinct() {
        let mut uuids: Vec<_> = Attribute::ALL.iter().map(|a| a.uuid()).collect();
        uuids.push(SERVICE_UUID);
        uuids.sort();
        uuids.dedup();
        assert_eq!(uuids.len(), 6);
    }

    #[test]
    fn access_modes() {
        assert!(!Attribute::Credentials.is_readable());
        assert!(Attribute::Credentials.is_writable());
        assert!(Attribute::DeviceName.is_readable() && Attribute::DeviceName.is_writable());
        assert!(!Attribute::NetworkStatus.is_writable());
    }
}
