//! Single active connection to an appliance

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use aquarisense_proto::{Attribute, Payload};

use crate::{Link, PeripheralHandle, ProvisioningError, Radio};

/// Owns the radio and hands out at most one [`Connection`] at a time.
///
/// The slot is released when the connection is closed or dropped; a dropped
/// connection is disconnected in the background and keeps the slot until
/// that finishes.
pub struct ConnectionManager<R: Radio> {
    radio: R,
    slot: Arc<Semaphore>,
    connect_timeout: Duration,
}

impl<R: Radio> ConnectionManager<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio,
            slot: Arc::new(Semaphore::new(1)),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn is_busy(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Connects, failing with [`ProvisioningError::ConnectionBusy`] if a
    /// connection is already open.
    pub async fn connect(&self, peripheral: &PeripheralHandle) -> Result<Connection<R::Link>, ProvisioningError> {
        let permit = self
            .slot
            .clone()
            .try_acquire_owned()
            .map_err(|_| ProvisioningError::ConnectionBusy)?;
        self.open(peripheral, permit).await
    }

    /// Connects once the previous connection has finished closing
    pub async fn connect_queued(
        &self,
        peripheral: &PeripheralHandle,
    ) -> Result<Connection<R::Link>, ProvisioningError> {
        if self.is_busy() {
            debug!("waiting for previous connection to close before connecting to {}", peripheral.id);
        }
        let permit = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProvisioningError::ConnectionBusy)?;
        self.open(peripheral, permit).await
    }

    async fn open(
        &self,
        peripheral: &PeripheralHandle,
        permit: OwnedSemaphorePermit,
    ) -> Result<Connection<R::Link>, ProvisioningError> {
        info!("connecting to {} ({})", peripheral.name, peripheral.id);
        let link = tokio::time::timeout(self.connect_timeout, self.radio.connect(peripheral))
            .await
            .map_err(|_| {
                ProvisioningError::ConnectionFailed(format!("timed out after {:?}", self.connect_timeout))
            })??;
        info!("connected to {}", peripheral.id);
        Ok(Connection {
            peripheral: peripheral.clone(),
            link: Some(link),
            ready: false,
            permit: Some(permit),
        })
    }
}

/// An open connection. Reads and writes take `&mut self`, so attribute I/O
/// on one connection is serialized.
pub struct Connection<L: Link + 'static> {
    peripheral: PeripheralHandle,
    link: Option<L>,
    ready: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl<L: Link + 'static> Connection<L> {
    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.peripheral
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Must complete before any read or write
    pub async fn discover(&mut self) -> Result<(), ProvisioningError> {
        let link = self.link.as_mut().ok_or(ProvisioningError::NotReady)?;
        link.discover().await.map_err(|e| match e {
            ProvisioningError::DiscoveryFailed(_) => e,
            other => ProvisioningError::DiscoveryFailed(other.to_string()),
        })?;
        self.ready = true;
        debug!("services discovered on {}", self.peripheral.id);
        Ok(())
    }

    fn ready_link(&mut self) -> Result<&mut L, ProvisioningError> {
        match self.link.as_mut() {
            Some(link) if self.ready => Ok(link),
            _ => Err(ProvisioningError::NotReady),
        }
    }

    pub async fn read(&mut self, attribute: Attribute) -> Result<Vec<u8>, ProvisioningError> {
        let link = self.ready_link()?;
        if !attribute.is_readable() {
            return Err(ProvisioningError::ReadFailed {
                attribute,
                reason: "attribute is write-only".to_string(),
            });
        }
        link.read(attribute).await.map_err(|e| match e {
            ProvisioningError::ReadFailed { .. } | ProvisioningError::NotReady => e,
            other => ProvisioningError::ReadFailed { attribute, reason: other.to_string() },
        })
    }

    pub async fn write(&mut self, attribute: Attribute, value: &[u8]) -> Result<(), ProvisioningError> {
        let link = self.ready_link()?;
        if !attribute.is_writable() {
            return Err(ProvisioningError::WriteFailed {
                attribute,
                reason: "attribute is read-only".to_string(),
            });
        }
        link.write(attribute, value).await.map_err(|e| match e {
            ProvisioningError::WriteFailed { .. } | ProvisioningError::NotReady => e,
            other => ProvisioningError::WriteFailed { attribute, reason: other.to_string() },
        })
    }

    pub async fn read_payload<T: Payload>(&mut self, attribute: Attribute) -> Result<T, ProvisioningError> {
        let value = self.read(attribute).await?;
        Ok(T::decode(&value)?)
    }

    pub async fn write_payload<T: Payload>(
        &mut self,
        attribute: Attribute,
        payload: &T,
    ) -> Result<(), ProvisioningError> {
        let value = payload.encode()?;
        self.write(attribute, &value).await
    }

    /// Disconnects and frees the connection slot
    pub async fn close(mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.disconnect().await {
                warn!("failed to disconnect from {}: {e}", self.peripheral.id);
            } else {
                info!("disconnected from {}", self.peripheral.id);
            }
        }
        self.permit.take();
    }
}

impl<L: Link + 'static> Drop for Connection<L> {
    fn drop(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        let permit = self.permit.take();
        let id = self.peripheral.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("connection to {id} dropped without close, disconnecting");
                runtime.spawn(async move {
                    if let Err(e) = link.disconnect().await {
                        warn!("failed to disconnect from {id}: {e}");
                    }
                    drop(permit);
                });
            }
            Err(_) => warn!("connection to {id} dropped outside a runtime, link left open"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeRadio;
    use aquarisense_proto::{DeviceIdentity, DeviceNameUpdate};

    fn p1() -> PeripheralHandle {
        PeripheralHandle { id: "P1".into(), name: "AquariSense-42".into(), rssi: Some(-50) }
    }

    #[tokio::test]
    async fn second_connect_is_refused_until_close() {
        let radio = FakeRadio::new().with_peripheral("P1", "AquariSense-42", -50);
        let manager = ConnectionManager::new(radio.clone());

        let first = manager.connect(&p1()).await.unwrap();
        assert_eq!(first.peripheral(), &p1());
        assert!(manager.is_busy());
        assert_eq!(manager.connect(&p1()).await.err(), Some(ProvisioningError::ConnectionBusy));
        assert_eq!(radio.connects(), 1);

        first.close().await;
        assert!(!manager.is_busy());
        let second = manager.connect(&p1()).await.unwrap();
        assert_eq!(radio.open_links(), 1);
        second.close().await;
        assert_eq!(radio.open_links(), 0);
    }

    #[tokio::test]
    async fn io_before_discovery_is_not_ready() {
        let radio = FakeRadio::new()
            .with_peripheral("P1", "AquariSense-42", -50)
            .with_value(Attribute::DeviceIdentity, &DeviceIdentity { id: "AQS-EU-M01-25-000001".into() });
        let manager = ConnectionManager::new(radio.clone());
        let mut connection = manager.connect(&p1()).await.unwrap();

        assert_eq!(
            connection.read(Attribute::DeviceIdentity).await.err(),
            Some(ProvisioningError::NotReady)
        );
        assert_eq!(
            connection.write(Attribute::DeviceName, b"x").await.err(),
            Some(ProvisioningError::NotReady)
        );
        assert_eq!(radio.reads(Attribute::DeviceIdentity), 0);

        connection.discover().await.unwrap();
        let identity: DeviceIdentity = connection.read_payload(Attribute::DeviceIdentity).await.unwrap();
        assert_eq!(identity.id, "AQS-EU-M01-25-000001");
        connection.close().await;
    }

    #[tokio::test]
    async fn missing_profile_fails_discovery() {
        let radio = FakeRadio::new().with_peripheral("P1", "AquariSense-42", -50).without_profile();
        let manager = ConnectionManager::new(radio);
        let mut connection = manager.connect(&p1()).await.unwrap();
        assert!(matches!(connection.discover().await, Err(ProvisioningError::DiscoveryFailed(_))));
        assert!(!connection.is_ready());
        connection.close().await;
    }

    #[tokio::test]
    async fn access_modes_are_enforced() {
        let radio = FakeRadio::new().with_peripheral("P1", "AquariSense-42", -50);
        let manager = ConnectionManager::new(radio.clone());
        let mut connection = manager.connect(&p1()).await.unwrap();
        connection.discover().await.unwrap();

        assert!(matches!(
            connection.read(Attribute::Credentials).await,
            Err(ProvisioningError::ReadFailed { attribute: Attribute::Credentials, .. })
        ));
        assert!(matches!(
            connection.write(Attribute::NetworkStatus, b"x").await,
            Err(ProvisioningError::WriteFailed { attribute: Attribute::NetworkStatus, .. })
        ));

        connection
            .write_payload(Attribute::DeviceName, &DeviceNameUpdate { name: "Reef".into() })
            .await
            .unwrap();
        assert_eq!(radio.writes(Attribute::DeviceName).len(), 1);
        connection.close().await;
    }

    #[tokio::test]
    async fn dropped_connection_is_disconnected_and_slot_freed() {
        let radio = FakeRadio::new().with_peripheral("P1", "AquariSense-42", -50);
        let manager = ConnectionManager::new(radio.clone());

        drop(manager.connect(&p1()).await.unwrap());
        let queued = manager.connect_queued(&p1()).await.unwrap();
        assert_eq!(radio.connects(), 2);
        assert_eq!(radio.open_links(), 1);
        queued.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_connect_times_out() {
        let radio = FakeRadio::new()
            .with_peripheral("P1", "AquariSense-42", -50)
            .with_connect_delay(Duration::from_secs(60));
        let manager = ConnectionManager::new(radio.clone()).with_connect_timeout(Duration::from_secs(10));
        let started = tokio::time::Instant::now();

        assert!(matches!(manager.connect(&p1()).await, Err(ProvisioningError::ConnectionFailed(_))));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert!(!manager.is_busy());
        assert_eq!(radio.open_links(), 0);
    }

    #[tokio::test]
    async fn connect_failure_frees_the_slot() {
        let radio = FakeRadio::new().with_peripheral("P1", "AquariSense-42", -50);
        radio.fail_next_connect("peripheral out of range");
        let manager = ConnectionManager::new(radio);

        assert!(matches!(manager.connect(&p1()).await, Err(ProvisioningError::ConnectionFailed(_))));
        assert!(!manager.is_busy());
    }
}
