//! AquariSense provisioning protocol - attribute payloads and their codec
//!
//! Every attribute value is UTF-8 JSON wrapped in standard base64. Records
//! implement [`Payload`], which gives them `encode`/`decode` over that
//! envelope.

pub mod ble;
mod serial;

pub use ble::Attribute;
pub use serial::{SerialNumber, SerialNumberError, format_serial_input};

use data_encoding::BASE64;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Reason reported when the appliance says `failed` without saying why
pub const DEFAULT_FAILURE_REASON: &str = "WiFi connection failed. Check password.";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The envelope did not unwrap to valid JSON
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    /// Valid JSON, but not the record that was asked for
    #[error("payload does not match schema: {0}")]
    SchemaMismatch(String),
}

/// A record carried in an attribute value
pub trait Payload: Serialize + DeserializeOwned {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| CodecError::SchemaMismatch(e.to_string()))?;
        Ok(BASE64.encode(&json).into_bytes())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let json = BASE64
            .decode(bytes)
            .map_err(|e| CodecError::MalformedPayload(format!("base64: {e}")))?;
        let text = std::str::from_utf8(&json)
            .map_err(|e| CodecError::MalformedPayload(format!("utf-8: {e}")))?;
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| CodecError::MalformedPayload(format!("json: {e}")))?;
        serde_json::from_value(value).map_err(|e| CodecError::SchemaMismatch(e.to_string()))
    }
}

/// device-identity (read)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
}

impl DeviceIdentity {
    pub fn serial_number(&self) -> Result<SerialNumber, SerialNumberError> {
        self.id.parse()
    }
}

/// device-name (read)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceName {
    pub id: String,
    pub name: String,
}

/// device-name (write)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNameUpdate {
    pub name: String,
}

/// One entry of network-list (read). SSIDs are not unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub ssid: String,
    /// dBm
    pub signal: i32,
    pub secure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalStrength {
    Strong,
    Fair,
    Weak,
}

impl NetworkDescriptor {
    pub fn strength(&self) -> SignalStrength {
        if self.signal > -50 {
            SignalStrength::Strong
        } else if self.signal > -70 {
            SignalStrength::Fair
        } else {
            SignalStrength::Weak
        }
    }
}

/// credentials (write). Never logged, never stored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// network-status (read)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProvisioningStatus {
    Idle,
    Connecting,
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
    },
    Failed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Disconnected,
}

impl ProvisioningStatus {
    /// `connected` and `failed` end a polling cycle, everything else is transient
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProvisioningStatus::Connected { .. } | ProvisioningStatus::Failed { .. }
        )
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            ProvisioningStatus::Failed { reason } => {
                Some(reason.as_deref().unwrap_or(DEFAULT_FAILURE_REASON))
            }
            _ => None,
        }
    }
}

impl Payload for DeviceIdentity {}
impl Payload for DeviceName {}
impl Payload for DeviceNameUpdate {}
impl Payload for Vec<NetworkDescriptor> {}
impl Payload for Credentials {}
impl Payload for ProvisioningStatus {}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(json: &str) -> Vec<u8> {
        BASE64.encode(json.as_bytes()).into_bytes()
    }

    #[test]
    fn round_trips_every_schema() {
        let identity = DeviceIdentity { id: "AQS-EU-M01-25-000001".into() };
        assert_eq!(DeviceIdentity::decode(&identity.encode().unwrap()).unwrap(), identity);

        let name = DeviceName { id: identity.id.clone(), name: "Living Room Tank".into() };
        assert_eq!(DeviceName::decode(&name.encode().unwrap()).unwrap(), name);

        let update = DeviceNameUpdate { name: "Reef 🐠".into() };
        assert_eq!(DeviceNameUpdate::decode(&update.encode().unwrap()).unwrap(), update);

        let networks = vec![
            NetworkDescriptor { ssid: "Home".into(), signal: -40, secure: true },
            NetworkDescriptor { ssid: "Home".into(), signal: -71, secure: true },
            NetworkDescriptor { ssid: "Cafe".into(), signal: -80, secure: false },
        ];
        assert_eq!(Vec::<NetworkDescriptor>::decode(&networks.encode().unwrap()).unwrap(), networks);

        let credentials = Credentials { ssid: "Home".into(), password: "secret123".into() };
        assert_eq!(Credentials::decode(&credentials.encode().unwrap()).unwrap(), credentials);

        for status in [
            ProvisioningStatus::Idle,
            ProvisioningStatus::Connecting,
            ProvisioningStatus::Connected {
                ssid: Some("Home".into()),
                ip: Some("192.168.1.42".into()),
            },
            ProvisioningStatus::Failed { reason: None },
            ProvisioningStatus::Disconnected,
        ] {
            assert_eq!(ProvisioningStatus::decode(&status.encode().unwrap()).unwrap(), status);
        }
    }

    #[test]
    fn decodes_firmware_status() {
        let status = ProvisioningStatus::decode(&envelope(
            r#"{"status":"connected","ssid":"MyNetwork","ip":"192.168.1.42"}"#,
        ))
        .unwrap();
        assert_eq!(
            status,
            ProvisioningStatus::Connected {
                ssid: Some("MyNetwork".into()),
                ip: Some("192.168.1.42".into())
            }
        );
        assert!(status.is_terminal());

        let idle = ProvisioningStatus::decode(&envelope(r#"{"status":"idle","ssid":null}"#)).unwrap();
        assert_eq!(idle, ProvisioningStatus::Idle);
        assert!(!idle.is_terminal());
    }

    #[test]
    fn failure_reason_defaults() {
        let failed = ProvisioningStatus::decode(&envelope(r#"{"status":"failed"}"#)).unwrap();
        assert_eq!(failed.failure_reason(), Some(DEFAULT_FAILURE_REASON));

        let failed = ProvisioningStatus::Failed { reason: Some("auth timeout".into()) };
        assert_eq!(failed.failure_reason(), Some("auth timeout"));
        assert_eq!(ProvisioningStatus::Connecting.failure_reason(), None);
    }

    #[test]
    fn bad_envelope_is_malformed() {
        let err = DeviceIdentity::decode(b"not base64!").unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)), "{err:?}");

        let err = DeviceIdentity::decode(&BASE64.encode(&[0xff, 0xfe]).into_bytes()).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)), "{err:?}");

        let err = DeviceIdentity::decode(&envelope("{\"id\": ")).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)), "{err:?}");
    }

    #[test]
    fn percent_encoded_json_is_not_accepted() {
        let err = DeviceIdentity::decode(&envelope("%7B%22id%22%3A%22x%22%7D")).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload(_)), "{err:?}");
    }

    #[test]
    fn wrong_shape_is_schema_mismatch() {
        let err = DeviceIdentity::decode(&envelope(r#"{"name":"x"}"#)).unwrap_err();
        assert!(matches!(err, CodecError::SchemaMismatch(_)), "{err:?}");

        let err = Vec::<NetworkDescriptor>::decode(&envelope(
            r#"[{"ssid":"Home","signal":"strong","secure":true}]"#,
        ))
        .unwrap_err();
        assert!(matches!(err, CodecError::SchemaMismatch(_)), "{err:?}");

        let err = ProvisioningStatus::decode(&envelope(r#"{"status":"rebooting"}"#)).unwrap_err();
        assert!(matches!(err, CodecError::SchemaMismatch(_)), "{err:?}");
    }

    #[test]
    fn signal_buckets() {
        let network = |signal| NetworkDescriptor { ssid: "x".into(), signal, secure: true };
        assert_eq!(network(-40).strength(), SignalStrength::Strong);
        assert_eq!(network(-50).strength(), SignalStrength::Fair);
        assert_eq!(network(-69).strength(), SignalStrength::Fair);
        assert_eq!(network(-70).strength(), SignalStrength::Weak);
    }

    #[test]
    fn credentials_debug_hides_password() {
        let credentials = Credentials { ssid: "Home".into(), password: "secret123".into() };
        assert!(!format!("{credentials:?}").contains("secret123"));
    }
}
