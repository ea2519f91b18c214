//! Network-status polling after credentials have been written.
//!
//! The appliance has no notifications wired up for the status
//! characteristic, so the controller reads it on a fixed cadence until it
//! reports `connected` or `failed`, or the attempt ceiling is reached.

use std::time::Duration;

use log::{debug, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use aquarisense_proto::{Attribute, ProvisioningStatus};

use crate::{Connection, Link, ProvisioningConfig, ProvisioningError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPoller {
    pub interval: Duration,
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl From<&ProvisioningConfig> for StatusPoller {
    fn from(config: &ProvisioningConfig) -> Self {
        Self {
            interval: config.status_interval,
            max_attempts: config.status_max_attempts,
            initial_delay: config.status_initial_delay,
        }
    }
}

async fn pause(cancel: &CancellationToken, duration: Duration) -> Result<(), ProvisioningError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProvisioningError::Cancelled),
        _ = sleep(duration) => Ok(()),
    }
}

impl StatusPoller {
    /// Reads network-status until it is terminal. Returns the terminal
    /// status, [`ProvisioningError::PollTimeout`] after `max_attempts` reads,
    /// or [`ProvisioningError::Cancelled`] without touching the connection
    /// again once `cancel` fires.
    ///
    /// `on_attempt` is told the number of every cycle as it starts.
    pub async fn poll_until_terminal<L: Link + 'static>(
        &self,
        connection: &mut Connection<L>,
        cancel: &CancellationToken,
        mut on_attempt: impl FnMut(u32),
    ) -> Result<ProvisioningStatus, ProvisioningError> {
        pause(cancel, self.initial_delay).await?;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                pause(cancel, self.interval).await?;
            }
            on_attempt(attempt);

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProvisioningError::Cancelled),
                read = connection.read_payload::<ProvisioningStatus>(Attribute::NetworkStatus) => read,
            };
            match read {
                Ok(status) if status.is_terminal() => {
                    debug!("status check {attempt}/{}: {status:?}", self.max_attempts);
                    return Ok(status);
                }
                Ok(status) => debug!("status check {attempt}/{}: {status:?}", self.max_attempts),
                Err(e) if e.is_transient() => warn!("status check {attempt}/{} failed: {e}", self.max_attempts),
                Err(e) => return Err(e),
            }
        }

        Err(ProvisioningError::PollTimeout { attempts: self.max_attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeRadio;
    use crate::{ConnectionManager, PeripheralHandle};
    use tokio::time::Instant;

    const POLLER: StatusPoller = StatusPoller {
        interval: Duration::from_secs(2),
        max_attempts: 30,
        initial_delay: Duration::from_secs(3),
    };

    fn manager_for(radio: &FakeRadio) -> (ConnectionManager<FakeRadio>, PeripheralHandle) {
        radio.advertise("P1", "AquariSense-42", -50);
        let peripheral = PeripheralHandle { id: "P1".into(), name: "AquariSense-42".into(), rssi: Some(-50) };
        (ConnectionManager::new(radio.clone()), peripheral)
    }

    fn home() -> ProvisioningStatus {
        ProvisioningStatus::Connected { ssid: Some("Home".into()), ip: Some("192.168.1.42".into()) }
    }

    #[tokio::test(start_paused = true)]
    async fn always_connecting_times_out_after_exactly_max_attempts() {
        for max_attempts in [1, 5, 30] {
            let radio = FakeRadio::new().with_value(Attribute::NetworkStatus, &ProvisioningStatus::Connecting);
            let (manager, peripheral) = manager_for(&radio);
            let mut connection = manager.connect(&peripheral).await.unwrap();
            connection.discover().await.unwrap();

            let poller = StatusPoller { max_attempts, ..POLLER };
            let mut cycles = Vec::new();
            let result = poller
                .poll_until_terminal(&mut connection, &CancellationToken::new(), |n| cycles.push(n))
                .await;

            assert_eq!(result, Err(ProvisioningError::PollTimeout { attempts: max_attempts }));
            assert_eq!(radio.reads(Attribute::NetworkStatus), max_attempts as usize);
            assert_eq!(cycles, (1..=max_attempts).collect::<Vec<_>>());
            connection.close().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_connected() {
        let radio = FakeRadio::new();
        radio.push_read(Attribute::NetworkStatus, &ProvisioningStatus::Idle);
        radio.push_read(Attribute::NetworkStatus, &ProvisioningStatus::Connecting);
        radio.push_read(Attribute::NetworkStatus, &home());
        let (manager, peripheral) = manager_for(&radio);
        let mut connection = manager.connect(&peripheral).await.unwrap();
        connection.discover().await.unwrap();
        let started = Instant::now();

        let status = POLLER
            .poll_until_terminal(&mut connection, &CancellationToken::new(), |_| {})
            .await
            .unwrap();

        assert_eq!(status, home());
        assert_eq!(radio.reads(Attribute::NetworkStatus), 3);
        // grace period, then two intervals
        assert_eq!(started.elapsed(), Duration::from_secs(7));
        connection.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_is_terminal() {
        let radio = FakeRadio::new();
        radio.push_read(Attribute::NetworkStatus, &ProvisioningStatus::Failed { reason: None });
        let (manager, peripheral) = manager_for(&radio);
        let mut connection = manager.connect(&peripheral).await.unwrap();
        connection.discover().await.unwrap();

        let status = POLLER
            .poll_until_terminal(&mut connection, &CancellationToken::new(), |_| {})
            .await
            .unwrap();
        assert_eq!(status, ProvisioningStatus::Failed { reason: None });
        connection.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn read_errors_count_as_cycles() {
        let radio = FakeRadio::new();
        radio.push_read_error(Attribute::NetworkStatus, "gatt error 0x0e");
        radio.push_raw_read(Attribute::NetworkStatus, b"garbage".to_vec());
        radio.push_read(Attribute::NetworkStatus, &home());
        let (manager, peripheral) = manager_for(&radio);
        let mut connection = manager.connect(&peripheral).await.unwrap();
        connection.discover().await.unwrap();

        let mut cycles = 0;
        let status = POLLER
            .poll_until_terminal(&mut connection, &CancellationToken::new(), |n| cycles = n)
            .await
            .unwrap();
        assert_eq!(status, home());
        assert_eq!(cycles, 3);

        radio.push_read_error(Attribute::NetworkStatus, "gatt error 0x0e");
        let poller = StatusPoller { max_attempts: 1, ..POLLER };
        let result = poller
            .poll_until_terminal(&mut connection, &CancellationToken::new(), |_| {})
            .await;
        assert_eq!(result, Err(ProvisioningError::PollTimeout { attempts: 1 }));
        connection.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_reads() {
        let radio = FakeRadio::new().with_value(Attribute::NetworkStatus, &ProvisioningStatus::Connecting);
        let (manager, peripheral) = manager_for(&radio);
        let mut connection = manager.connect(&peripheral).await.unwrap();
        connection.discover().await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            // grace period plus two intervals, between the third and fourth read
            sleep(Duration::from_secs(8)).await;
            trigger.cancel();
        });

        let result = POLLER.poll_until_terminal(&mut connection, &cancel, |_| {}).await;
        assert_eq!(result, Err(ProvisioningError::Cancelled));
        assert_eq!(radio.reads(Attribute::NetworkStatus), 3);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(radio.reads(Attribute::NetworkStatus), 3);
        connection.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_during_grace_period_never_reads() {
        let radio = FakeRadio::new().with_value(Attribute::NetworkStatus, &ProvisioningStatus::Connecting);
        let (manager, peripheral) = manager_for(&radio);
        let mut connection = manager.connect(&peripheral).await.unwrap();
        connection.discover().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = POLLER.poll_until_terminal(&mut connection, &cancel, |_| {}).await;
        assert_eq!(result, Err(ProvisioningError::Cancelled));
        assert_eq!(radio.reads(Attribute::NetworkStatus), 0);
        connection.close().await;
    }
}
