//! Time-bounded scan for AquariSense peripherals

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::{PeripheralHandle, ProvisioningError, Radio};

pub struct Scanner<'r, R: Radio> {
    radio: &'r R,
    name_filter: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl<'r, R: Radio> Scanner<'r, R> {
    pub fn new(radio: &'r R, name_filter: &str, timeout: Duration) -> Self {
        Self {
            radio,
            name_filter: name_filter.to_string(),
            timeout,
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Starts the radio scan. A failure to start is reported, never retried.
    pub async fn start(self, cancel: CancellationToken) -> Result<Scan<'r, R>, ProvisioningError> {
        self.radio.start_scan().await.map_err(|e| match e {
            ProvisioningError::ScanUnavailable(_) => e,
            other => ProvisioningError::ScanUnavailable(other.to_string()),
        })?;
        debug!("scanning for {:?} for {:?}", self.name_filter, self.timeout);

        Ok(Scan {
            radio: self.radio,
            name_filter: self.name_filter,
            deadline: Instant::now() + self.timeout,
            poll_interval: self.poll_interval,
            seen: HashSet::new(),
            pending: VecDeque::new(),
            cancel,
            finished: false,
        })
    }
}

/// A running scan. Yields every matching peripheral at most once, ends at
/// the deadline or on cancellation. Call [`Scan::stop`] when done with it.
pub struct Scan<'r, R: Radio> {
    radio: &'r R,
    name_filter: String,
    deadline: Instant,
    poll_interval: Duration,
    seen: HashSet<String>,
    pending: VecDeque<PeripheralHandle>,
    cancel: CancellationToken,
    finished: bool,
}

impl<R: Radio> Scan<'_, R> {
    pub async fn next(&mut self) -> Option<PeripheralHandle> {
        loop {
            if let Some(peripheral) = self.pending.pop_front() {
                return Some(peripheral);
            }
            if self.finished {
                return None;
            }
            let now = Instant::now();
            if self.cancel.is_cancelled() || now >= self.deadline {
                self.finished = true;
                continue;
            }

            match self.radio.discovered().await {
                Ok(peripherals) => {
                    for peripheral in peripherals {
                        if !peripheral.matches(&self.name_filter) {
                            continue;
                        }
                        if self.seen.insert(peripheral.id.clone()) {
                            info!("found {} ({}) rssi {:?}", peripheral.name, peripheral.id, peripheral.rssi);
                            self.pending.push_back(peripheral);
                        }
                    }
                }
                Err(e) => warn!("failed to list discovered peripherals: {e}"),
            }
            if !self.pending.is_empty() {
                continue;
            }

            let wait = self.poll_interval.min(self.deadline - now);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => self.finished = true,
                _ = sleep(wait) => {}
            }
        }
    }

    /// Drains the scan, collecting everything it yields
    pub async fn collect(mut self) -> Vec<PeripheralHandle> {
        let mut found = Vec::new();
        while let Some(peripheral) = self.next().await {
            found.push(peripheral);
        }
        self.stop().await;
        found
    }

    pub async fn stop(self) {
        if let Err(e) = self.radio.stop_scan().await {
            debug!("failed to stop scan cleanly: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeRadio;

    #[tokio::test(start_paused = true)]
    async fn yields_each_peripheral_once() {
        let radio = FakeRadio::new()
            .with_peripheral("P1", "AquariSense-42", -50)
            .with_peripheral("P2", "Kettle", -40)
            .with_peripheral("P3", "aquarisense-7", -70);

        let scan = Scanner::new(&radio, "AquariSense", Duration::from_secs(5))
            .start(CancellationToken::new())
            .await
            .unwrap();
        let found = scan.collect().await;

        let ids: Vec<_> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["P1", "P3"]);
        assert!(radio.discovered_calls() > 2, "the adapter keeps re-reporting peripherals");
        assert!(!radio.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn same_name_units_are_told_apart_by_id() {
        let radio = FakeRadio::new()
            .with_peripheral("6d1a0b3e-0c4f-4f7e-9a51-2f0c3f1e0a01", "AquariSense", -50)
            .with_peripheral("6d1a0b3e-0c4f-4f7e-9a51-2f0c3f1e0a02", "AquariSense", -62);

        let found = Scanner::new(&radio, "aquarisense", Duration::from_secs(5))
            .start(CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(found.len(), 2);
        assert_ne!(found[0].id, found[1].id);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_the_deadline() {
        let radio = FakeRadio::new();
        let started = Instant::now();

        let mut scan = Scanner::new(&radio, "aquarisense", Duration::from_secs(30))
            .start(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(scan.next().await, None);
        scan.stop().await;

        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn late_advertisement_is_found() {
        let radio = FakeRadio::new();
        let later = radio.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(4)).await;
            later.advertise("P9", "AquariSense-9", -55);
        });

        let mut scan = Scanner::new(&radio, "aquarisense", Duration::from_secs(30))
            .start(CancellationToken::new())
            .await
            .unwrap();
        let found = scan.next().await.unwrap();
        scan.stop().await;
        assert_eq!(found.id, "P9");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_scan() {
        let radio = FakeRadio::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });
        let started = Instant::now();

        let mut scan = Scanner::new(&radio, "aquarisense", Duration::from_secs(30))
            .start(cancel)
            .await
            .unwrap();
        assert_eq!(scan.next().await, None);
        scan.stop().await;
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn start_failure_is_scan_unavailable() {
        let radio = FakeRadio::new().with_scan_error("bluetooth permission denied");
        let result = Scanner::new(&radio, "aquarisense", Duration::from_secs(30))
            .start(CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ProvisioningError::ScanUnavailable(_))));
    }
}
