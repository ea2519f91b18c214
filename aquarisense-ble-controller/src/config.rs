use std::time::Duration;

/// Tunables of a provisioning session. `Default` carries the values the
/// AquariSense firmware is tested against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningConfig {
    /// Case-insensitive fragment of the advertised name
    pub name_filter: String,
    /// Wall-clock bound of one scan
    pub scan_timeout: Duration,
    /// How often the scanner looks at the adapter's discovered peripherals
    pub scan_poll_interval: Duration,
    pub connect_timeout: Duration,
    /// Spacing between network-status reads
    pub status_interval: Duration,
    pub status_max_attempts: u32,
    /// Grace period before the first network-status read, the appliance
    /// needs it to start associating with the access point
    pub status_initial_delay: Duration,
    /// Automatic rescans after a failed connect before waiting for the user
    pub max_auto_reconnects: u32,
    /// Peripherals in a row without the AquariSense profile before giving up
    pub max_discovery_failures: u32,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            name_filter: aquarisense_proto::ble::ADVERTISED_NAME.to_string(),
            scan_timeout: Duration::from_secs(30),
            scan_poll_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            status_interval: Duration::from_secs(2),
            status_max_attempts: 30,
            status_initial_delay: Duration::from_secs(3),
            max_auto_reconnects: 3,
            max_discovery_failures: 2,
        }
    }
}
