//! Stages of a provisioning session and the transitions between them.
//!
//! ```text
//! Init --RadioReady--> Scanning --ScanMatched--> Connecting --Connected--> DiscoveringNetworks
//!   DiscoveringNetworks --NetworksLoaded--> NetworkSelection --NetworkSelected--> NetworkSelection
//!   NetworkSelection --CredentialsSubmitted--> SubmittingCredentials --CredentialsWritten--> Polling
//!   Polling --Joined--> Done
//!
//! Connecting --ConnectFailed--> Scanning                 (automatic rescan, capped)
//! Connecting --Abandoned--> Failed                       (repeated discovery failures)
//! Scanning --ScanExhausted / ScanFailed--> Scanning      (awaiting retry)
//! SubmittingCredentials --CredentialsRejected--> NetworkSelection
//! Polling --JoinFailed--> NetworkSelection
//! any non-terminal --Cancel--> Cancelled
//! ```
//!
//! [`transition`] is pure; the session performs the radio I/O and feeds the
//! outcome back in as an [`Event`].

use aquarisense_proto::{DeviceIdentity, NetworkDescriptor};

use crate::{PeripheralHandle, ProvisioningError};

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Waiting for the radio to become ready
    Init,
    /// Looking for an appliance. When `awaiting_retry` the scan has ended
    /// without a match and only a user retry starts a new one.
    Scanning { awaiting_retry: bool },
    Connecting { peripheral: PeripheralHandle },
    /// Connected, the network list has not been read successfully yet
    DiscoveringNetworks { identity: DeviceIdentity },
    /// Networks are listed, the user picks one and enters a password
    NetworkSelection {
        identity: DeviceIdentity,
        networks: Vec<NetworkDescriptor>,
        selected: Option<NetworkDescriptor>,
    },
    SubmittingCredentials {
        identity: DeviceIdentity,
        networks: Vec<NetworkDescriptor>,
        network: NetworkDescriptor,
    },
    Polling {
        identity: DeviceIdentity,
        networks: Vec<NetworkDescriptor>,
        network: NetworkDescriptor,
    },
    /// The appliance joined the network
    Done {
        identity: DeviceIdentity,
        ssid: Option<String>,
        ip: Option<String>,
    },
    /// Provisioning cannot continue with this appliance
    Failed { error: ProvisioningError },
    Cancelled,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Init => "initializing",
            Stage::Scanning { awaiting_retry: false } => "scanning",
            Stage::Scanning { awaiting_retry: true } => "waiting for scan retry",
            Stage::Connecting { .. } => "connecting",
            Stage::DiscoveringNetworks { .. } => "discovering networks",
            Stage::NetworkSelection { .. } => "selecting a network",
            Stage::SubmittingCredentials { .. } => "submitting credentials",
            Stage::Polling { .. } => "waiting for the appliance to join",
            Stage::Done { .. } => "done",
            Stage::Failed { .. } => "failed",
            Stage::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done { .. } | Stage::Failed { .. } | Stage::Cancelled)
    }

    /// Identity of the connected appliance, once read
    pub fn identity(&self) -> Option<&DeviceIdentity> {
        match self {
            Stage::DiscoveringNetworks { identity }
            | Stage::NetworkSelection { identity, .. }
            | Stage::SubmittingCredentials { identity, .. }
            | Stage::Polling { identity, .. }
            | Stage::Done { identity, .. } => Some(identity),
            _ => None,
        }
    }

    pub fn networks(&self) -> &[NetworkDescriptor] {
        match self {
            Stage::NetworkSelection { networks, .. }
            | Stage::SubmittingCredentials { networks, .. }
            | Stage::Polling { networks, .. } => networks,
            _ => &[],
        }
    }

    pub fn selected_network(&self) -> Option<&NetworkDescriptor> {
        match self {
            Stage::NetworkSelection { selected, .. } => selected.as_ref(),
            Stage::SubmittingCredentials { network, .. } | Stage::Polling { network, .. } => Some(network),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RadioReady,
    RadioUnavailable(ProvisioningError),
    /// User asked for a new scan
    ScanStarted,
    ScanFailed(ProvisioningError),
    ScanMatched(PeripheralHandle),
    ScanExhausted,
    Connected(DeviceIdentity),
    ConnectFailed { error: ProvisioningError, auto_retry: bool },
    Abandoned(ProvisioningError),
    NetworksLoaded(Vec<NetworkDescriptor>),
    NetworksUnavailable(ProvisioningError),
    NetworkSelected(NetworkDescriptor),
    CredentialsSubmitted,
    CredentialsWritten,
    CredentialsRejected(ProvisioningError),
    Joined { ssid: Option<String>, ip: Option<String> },
    JoinFailed(ProvisioningError),
    Cancel,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::RadioReady => "mark the radio ready",
            Event::RadioUnavailable(_) => "mark the radio unavailable",
            Event::ScanStarted => "start a scan",
            Event::ScanFailed(_) => "fail a scan",
            Event::ScanMatched(_) => "match a peripheral",
            Event::ScanExhausted => "end a scan",
            Event::Connected(_) => "complete a connection",
            Event::ConnectFailed { .. } => "fail a connection",
            Event::Abandoned(_) => "abandon the appliance",
            Event::NetworksLoaded(_) => "load networks",
            Event::NetworksUnavailable(_) => "fail to load networks",
            Event::NetworkSelected(_) => "select a network",
            Event::CredentialsSubmitted => "submit credentials",
            Event::CredentialsWritten => "confirm credentials",
            Event::CredentialsRejected(_) => "reject credentials",
            Event::Joined { .. } => "join the network",
            Event::JoinFailed(_) => "fail to join the network",
            Event::Cancel => "cancel",
        }
    }

    /// The error this event reports, recorded as the session's last error
    pub fn error(&self) -> Option<&ProvisioningError> {
        match self {
            Event::RadioUnavailable(e)
            | Event::ScanFailed(e)
            | Event::ConnectFailed { error: e, .. }
            | Event::Abandoned(e)
            | Event::NetworksUnavailable(e)
            | Event::CredentialsRejected(e)
            | Event::JoinFailed(e) => Some(e),
            _ => None,
        }
    }

    /// Events that start over clear the previous error
    pub fn clears_error(&self) -> bool {
        matches!(
            self,
            Event::ScanStarted
                | Event::Connected(_)
                | Event::NetworksLoaded(_)
                | Event::CredentialsSubmitted
                | Event::Joined { .. }
        )
    }
}

/// Next stage after `event` in `stage`, or
/// [`ProvisioningError::InvalidStage`] if `stage` does not accept it.
pub fn transition(stage: &Stage, event: &Event) -> Result<Stage, ProvisioningError> {
    let next = match (stage, event) {
        (stage, Event::Cancel) if stage.is_terminal() => stage.clone(),
        (_, Event::Cancel) => Stage::Cancelled,

        (Stage::Init, Event::RadioReady) => Stage::Scanning { awaiting_retry: false },
        (Stage::Init, Event::RadioUnavailable(error)) => Stage::Failed { error: error.clone() },

        (Stage::Scanning { awaiting_retry: true }, Event::ScanStarted) => {
            Stage::Scanning { awaiting_retry: false }
        }
        (Stage::Scanning { awaiting_retry: false }, Event::ScanMatched(peripheral)) => {
            Stage::Connecting { peripheral: peripheral.clone() }
        }
        (Stage::Scanning { awaiting_retry: false }, Event::ScanExhausted | Event::ScanFailed(_)) => {
            Stage::Scanning { awaiting_retry: true }
        }

        (Stage::Connecting { .. }, Event::Connected(identity)) => {
            Stage::DiscoveringNetworks { identity: identity.clone() }
        }
        (Stage::Connecting { .. }, Event::ConnectFailed { auto_retry, .. }) => {
            Stage::Scanning { awaiting_retry: !auto_retry }
        }
        (Stage::Connecting { .. }, Event::Abandoned(error)) => Stage::Failed { error: error.clone() },

        (Stage::DiscoveringNetworks { identity }, Event::NetworksLoaded(networks)) => {
            Stage::NetworkSelection {
                identity: identity.clone(),
                networks: networks.clone(),
                selected: None,
            }
        }
        (Stage::DiscoveringNetworks { .. }, Event::NetworksUnavailable(_)) => stage.clone(),
        (Stage::NetworkSelection { identity, selected, .. }, Event::NetworksLoaded(networks)) => {
            // a selection survives only while its SSID is still visible
            let selected = selected
                .as_ref()
                .and_then(|current| networks.iter().find(|n| n.ssid == current.ssid))
                .cloned();
            Stage::NetworkSelection { identity: identity.clone(), networks: networks.clone(), selected }
        }
        (Stage::NetworkSelection { .. }, Event::NetworksUnavailable(_)) => stage.clone(),
        (Stage::NetworkSelection { identity, networks, .. }, Event::NetworkSelected(network)) => {
            Stage::NetworkSelection {
                identity: identity.clone(),
                networks: networks.clone(),
                selected: Some(network.clone()),
            }
        }
        (
            Stage::NetworkSelection { identity, networks, selected: Some(network) },
            Event::CredentialsSubmitted,
        ) => Stage::SubmittingCredentials {
            identity: identity.clone(),
            networks: networks.clone(),
            network: network.clone(),
        },

        (Stage::SubmittingCredentials { identity, networks, network }, Event::CredentialsWritten) => {
            Stage::Polling {
                identity: identity.clone(),
                networks: networks.clone(),
                network: network.clone(),
            }
        }
        (Stage::SubmittingCredentials { identity, networks, network }, Event::CredentialsRejected(_))
        | (Stage::Polling { identity, networks, network }, Event::JoinFailed(_)) => Stage::NetworkSelection {
            identity: identity.clone(),
            networks: networks.clone(),
            selected: Some(network.clone()),
        },

        (Stage::Polling { identity, .. }, Event::Joined { ssid, ip }) => Stage::Done {
            identity: identity.clone(),
            ssid: ssid.clone(),
            ip: ip.clone(),
        },

        (stage, event) => {
            return Err(ProvisioningError::InvalidStage { stage: stage.name(), action: event.name() });
        }
    };
    Ok(next)
}
