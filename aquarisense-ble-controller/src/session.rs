//! The provisioning session: drives one appliance from scan to joined network.
//!
//! The session owns the radio through its [`ConnectionManager`] and is driven
//! by the host one step at a time ([`ProvisioningSession::start`],
//! [`ProvisioningSession::select_network`],
//! [`ProvisioningSession::submit_password`], ...). Each step runs the radio
//! I/O it needs, then feeds the outcome through [`transition`].
//!
//! An operation that fails returns its error and also keeps it as
//! [`ProvisioningSession::last_error`]. Cancelling the session's token tears
//! it down at the next suspension point; that is not reported as an error.

use std::future::Future;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use aquarisense_proto::{
    Attribute, Credentials, DeviceIdentity, DeviceName, DeviceNameUpdate, NetworkDescriptor, ProvisioningStatus,
};

use crate::stage::{Event, Stage, transition};
use crate::{
    Connection, ConnectionManager, PeripheralHandle, ProvisioningConfig, ProvisioningError, Radio, Scanner,
    StatusPoller,
};

/// What a host renders: published on every change
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub stage: Stage,
    pub last_error: Option<ProvisioningError>,
    /// Status checks made in the current polling stage
    pub attempt_count: u32,
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T, ProvisioningError>>,
) -> Result<T, ProvisioningError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProvisioningError::Cancelled),
        result = operation => result,
    }
}

pub struct ProvisioningSession<R: Radio> {
    connections: ConnectionManager<R>,
    connection: Option<Connection<R::Link>>,
    config: ProvisioningConfig,
    cancel: CancellationToken,
    stage: Stage,
    last_error: Option<ProvisioningError>,
    attempt_count: u32,
    reconnects: u32,
    discovery_failures: u32,
    updates: watch::Sender<Snapshot>,
}

impl<R: Radio> ProvisioningSession<R> {
    pub fn new(radio: R, config: ProvisioningConfig) -> Self {
        let (updates, _) = watch::channel(Snapshot {
            stage: Stage::Init,
            last_error: None,
            attempt_count: 0,
        });
        Self {
            connections: ConnectionManager::new(radio).with_connect_timeout(config.connect_timeout),
            connection: None,
            config,
            cancel: CancellationToken::new(),
            stage: Stage::Init,
            last_error: None,
            attempt_count: 0,
            reconnects: 0,
            discovery_failures: 0,
            updates,
        }
    }

    /// Cancelling this token tears the session down: at the next suspension
    /// point while an operation runs, otherwise when the host next calls
    /// into the session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    pub fn last_error(&self) -> Option<&ProvisioningError> {
        self.last_error.as_ref()
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            stage: self.stage.clone(),
            last_error: self.last_error.clone(),
            attempt_count: self.attempt_count,
        }
    }

    fn publish(&self) {
        self.updates.send_replace(self.snapshot());
    }

    fn apply(&mut self, event: Event) -> Result<(), ProvisioningError> {
        let next = transition(&self.stage, &event)?;
        if next != self.stage {
            debug!("{} -> {}", self.stage, next);
        }
        if let Some(error) = event.error() {
            self.last_error = Some(error.clone());
        } else if event.clears_error() {
            self.last_error = None;
        }
        if matches!(next, Stage::Polling { .. }) {
            self.attempt_count = 0;
        }
        self.stage = next;
        self.publish();
        Ok(())
    }

    /// Applies an event that reports `error` and hands the error back
    fn fail(&mut self, event: Event) -> Result<(), ProvisioningError> {
        let error = event.error().cloned().unwrap_or(ProvisioningError::Cancelled);
        self.apply(event)?;
        Err(error)
    }

    /// Records an error that leaves the stage unchanged
    fn report(&mut self, error: ProvisioningError) -> ProvisioningError {
        self.last_error = Some(error.clone());
        self.publish();
        error
    }

    /// The token was cancelled while no operation was running
    fn cancelled_while_idle(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn invalid(&self, action: &'static str) -> ProvisioningError {
        ProvisioningError::InvalidStage { stage: self.stage.name(), action }
    }

    /// Waits for the radio, then scans and connects to the first appliance
    /// found and reads its networks.
    ///
    /// Ends in network selection on success. A scan that finds nothing leaves
    /// the session waiting for [`Self::retry_scan`].
    pub async fn start(&mut self) -> Result<(), ProvisioningError> {
        if self.cancelled_while_idle() {
            return self.teardown().await;
        }
        if self.stage != Stage::Init {
            return Err(self.invalid("start"));
        }
        match cancellable(&self.cancel, self.connections.radio().wait_ready()).await {
            Ok(()) => self.apply(Event::RadioReady)?,
            Err(ProvisioningError::Cancelled) => return self.teardown().await,
            Err(e @ ProvisioningError::ScanUnavailable(_)) => return self.fail(Event::RadioUnavailable(e)),
            Err(e) => return self.fail(Event::RadioUnavailable(ProvisioningError::ScanUnavailable(e.to_string()))),
        }
        self.scan_and_connect().await
    }

    /// Scans again after a scan ended without a usable appliance
    pub async fn retry_scan(&mut self) -> Result<(), ProvisioningError> {
        if self.cancelled_while_idle() {
            return self.teardown().await;
        }
        self.apply(Event::ScanStarted)?;
        self.reconnects = 0;
        self.scan_and_connect().await
    }

    async fn scan_and_connect(&mut self) -> Result<(), ProvisioningError> {
        while self.stage == (Stage::Scanning { awaiting_retry: false }) {
            let found = match self.scan_for_match().await {
                Ok(found) => found,
                Err(e) => return self.fail(Event::ScanFailed(e)),
            };
            if self.cancel.is_cancelled() {
                return self.teardown().await;
            }
            let Some(peripheral) = found else {
                info!("no appliance found within {:?}", self.config.scan_timeout);
                return self.apply(Event::ScanExhausted);
            };
            self.apply(Event::ScanMatched(peripheral.clone()))?;
            self.connect(&peripheral).await?;
        }

        if matches!(self.stage, Stage::DiscoveringNetworks { .. }) {
            self.refresh_networks().await?;
        }
        Ok(())
    }

    async fn scan_for_match(&self) -> Result<Option<PeripheralHandle>, ProvisioningError> {
        let mut scan = Scanner::new(self.connections.radio(), &self.config.name_filter, self.config.scan_timeout)
            .with_poll_interval(self.config.scan_poll_interval)
            .start(self.cancel.clone())
            .await?;
        let found = scan.next().await;
        scan.stop().await;
        Ok(found)
    }

    /// Connects, resolves the profile and reads the identity. Failures go
    /// back to scanning while the reconnect budget lasts.
    async fn connect(&mut self, peripheral: &PeripheralHandle) -> Result<(), ProvisioningError> {
        let error = match self.open(peripheral).await {
            Ok((connection, identity)) => {
                info!("provisioning {} ({})", identity.id, peripheral.id);
                self.connection = Some(connection);
                self.reconnects = 0;
                self.discovery_failures = 0;
                return self.apply(Event::Connected(identity));
            }
            Err(ProvisioningError::Cancelled) => return self.teardown().await,
            Err(e) => e,
        };

        if matches!(error, ProvisioningError::DiscoveryFailed(_)) {
            self.discovery_failures += 1;
            if self.discovery_failures >= self.config.max_discovery_failures {
                warn!("giving up after {} peripherals without the AquariSense service", self.discovery_failures);
                return self.fail(Event::Abandoned(error));
            }
        }
        self.reconnects += 1;
        let auto_retry = self.reconnects <= self.config.max_auto_reconnects;
        if auto_retry {
            warn!(
                "connection to {} failed ({error}), rescanning {}/{}",
                peripheral.id, self.reconnects, self.config.max_auto_reconnects
            );
            self.apply(Event::ConnectFailed { error, auto_retry })
        } else {
            self.fail(Event::ConnectFailed { error, auto_retry })
        }
    }

    async fn open(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<(Connection<R::Link>, DeviceIdentity), ProvisioningError> {
        let mut connection = cancellable(&self.cancel, self.connections.connect_queued(peripheral)).await?;
        let identity = cancellable(&self.cancel, async {
            connection.discover().await?;
            connection.read_payload::<DeviceIdentity>(Attribute::DeviceIdentity).await
        })
        .await;
        match identity {
            Ok(identity) => Ok((connection, identity)),
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    /// Reads the network list again. Keeps the current selection while the
    /// appliance still sees it; on failure the stage is unchanged so the host
    /// can simply retry.
    pub async fn refresh_networks(&mut self) -> Result<(), ProvisioningError> {
        if self.cancelled_while_idle() {
            return self.teardown().await;
        }
        if !matches!(self.stage, Stage::DiscoveringNetworks { .. } | Stage::NetworkSelection { .. }) {
            return Err(self.invalid("refresh networks"));
        }
        let connection = self.connection.as_mut().ok_or(ProvisioningError::NotReady)?;
        let networks = cancellable(
            &self.cancel,
            connection.read_payload::<Vec<NetworkDescriptor>>(Attribute::NetworkList),
        )
        .await;
        match networks {
            Ok(networks) => {
                debug!("{} networks visible to the appliance", networks.len());
                self.apply(Event::NetworksLoaded(networks))
            }
            Err(ProvisioningError::Cancelled) => self.teardown().await,
            Err(e) => self.fail(Event::NetworksUnavailable(e)),
        }
    }

    /// Picks the network to join. May be called again to change it.
    pub async fn select_network(&mut self, network: NetworkDescriptor) -> Result<(), ProvisioningError> {
        if self.cancelled_while_idle() {
            return self.teardown().await;
        }
        self.apply(Event::NetworkSelected(network))
    }

    /// Writes credentials for the selected network and waits for the
    /// appliance to join it. Any failure returns to network selection with
    /// the network still selected.
    pub async fn submit_password(&mut self, password: String) -> Result<(), ProvisioningError> {
        if self.cancelled_while_idle() {
            return self.teardown().await;
        }
        let Some(network) = self.stage.selected_network().cloned() else {
            return Err(self.invalid("submit credentials"));
        };
        if self.connection.is_none() {
            return Err(ProvisioningError::NotReady);
        }
        self.apply(Event::CredentialsSubmitted)?;

        let credentials = Credentials { ssid: network.ssid.clone(), password };
        let connection = self.connection.as_mut().ok_or(ProvisioningError::NotReady)?;
        info!("sending credentials for {}", network.ssid);
        match cancellable(&self.cancel, connection.write_payload(Attribute::Credentials, &credentials)).await {
            Ok(()) => self.apply(Event::CredentialsWritten)?,
            Err(ProvisioningError::Cancelled) => return self.teardown().await,
            Err(e) => return self.fail(Event::CredentialsRejected(e)),
        }

        let poller = StatusPoller::from(&self.config);
        let connection = self.connection.as_mut().ok_or(ProvisioningError::NotReady)?;
        let updates = &self.updates;
        let mut attempts = 0;
        let status = poller
            .poll_until_terminal(connection, &self.cancel, |attempt| {
                attempts = attempt;
                updates.send_modify(|snapshot| snapshot.attempt_count = attempt);
            })
            .await;
        self.attempt_count = attempts;

        match status {
            Ok(ProvisioningStatus::Connected { ssid, ip }) => {
                info!(
                    "appliance joined {} with address {}",
                    ssid.as_deref().unwrap_or(&network.ssid),
                    ip.as_deref().unwrap_or("unknown")
                );
                self.apply(Event::Joined { ssid, ip })
            }
            Ok(status) => {
                let reason = status.failure_reason().unwrap_or(aquarisense_proto::DEFAULT_FAILURE_REASON);
                self.fail(Event::JoinFailed(ProvisioningError::RemoteProvisioningFailed(reason.to_string())))
            }
            Err(ProvisioningError::Cancelled) => self.teardown().await,
            Err(e) => self.fail(Event::JoinFailed(e)),
        }
    }

    /// Writes a new display name and returns the record read back from the
    /// appliance.
    pub async fn rename_device(&mut self, name: &str) -> Result<DeviceName, ProvisioningError> {
        if self.cancelled_while_idle() {
            self.teardown().await?;
            return Err(ProvisioningError::Cancelled);
        }
        if self.stage.identity().is_none() {
            return Err(self.invalid("rename the device"));
        }
        let connection = self.connection.as_mut().ok_or(ProvisioningError::NotReady)?;
        let update = DeviceNameUpdate { name: name.to_string() };
        let renamed = cancellable(&self.cancel, async {
            connection.write_payload(Attribute::DeviceName, &update).await?;
            connection.read_payload::<DeviceName>(Attribute::DeviceName).await
        })
        .await;
        match renamed {
            Ok(renamed) => {
                info!("{} is now called {:?}", renamed.id, renamed.name);
                Ok(renamed)
            }
            Err(ProvisioningError::Cancelled) => {
                self.teardown().await?;
                Err(ProvisioningError::Cancelled)
            }
            Err(e) => Err(self.report(e)),
        }
    }

    /// Stops any scan, closes any connection and ends in `Cancelled`
    pub async fn cancel(&mut self) -> Result<(), ProvisioningError> {
        self.cancel.cancel();
        self.teardown().await
    }

    async fn teardown(&mut self) -> Result<(), ProvisioningError> {
        if matches!(self.stage, Stage::Scanning { .. }) {
            if let Err(e) = self.connections.radio().stop_scan().await {
                debug!("failed to stop scan: {e}");
            }
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        if !self.stage.is_terminal() {
            info!("provisioning cancelled while {}", self.stage);
        }
        self.apply(Event::Cancel)
    }

    /// Disconnects from the appliance, keeping the final stage
    pub async fn close(mut self) -> Snapshot {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.snapshot()
    }
}
