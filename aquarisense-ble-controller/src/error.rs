use aquarisense_proto::{Attribute, CodecError};

/// Everything that can go wrong while provisioning an appliance.
///
/// Kept `Clone` so the session can hold on to the last error and publish it
/// to the host alongside the stage it left the session in.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    /// Radio missing, powered off, or permission denied
    #[error("bluetooth unavailable: {0}")]
    ScanUnavailable(String),
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),
    /// A connection to an appliance is already open
    #[error("another appliance connection is still open")]
    ConnectionBusy,
    /// Connected peripheral does not expose the AquariSense profile
    #[error("AquariSense service not found: {0}")]
    DiscoveryFailed(String),
    #[error("attribute access before service discovery completed")]
    NotReady,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to read {attribute}: {reason}")]
    ReadFailed { attribute: Attribute, reason: String },
    #[error("failed to write {attribute}: {reason}")]
    WriteFailed { attribute: Attribute, reason: String },
    #[error("connection timed out after {attempts} status checks")]
    PollTimeout { attempts: u32 },
    #[error("{0}")]
    RemoteProvisioningFailed(String),
    #[error("cannot {action} while {stage}")]
    InvalidStage { stage: &'static str, action: &'static str },
    /// The session was torn down. Never recorded as the last error.
    #[error("provisioning cancelled")]
    Cancelled,
}

impl ProvisioningError {
    /// Errors the appliance or the radio may recover from on their own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProvisioningError::ReadFailed { .. } | ProvisioningError::Codec(_)
        )
    }
}
