//! Scripted in-memory AquariSense for driving the controller without a radio.
//!
//! Every attribute has a queue of scripted read results, consumed first, and
//! an optional sticky value returned once the queue is empty. All attribute
//! access is logged so tests can assert on what the controller did.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use aquarisense_proto::{Attribute, Payload};

use crate::{Link, PeripheralHandle, ProvisioningError, Radio};

#[derive(Default)]
struct FakeState {
    unavailable: Option<String>,
    scan_error: Option<String>,
    scanning: bool,
    advertisements: Vec<PeripheralHandle>,
    discovered_calls: usize,
    connect_errors: VecDeque<String>,
    connect_delay: Option<Duration>,
    connects: usize,
    open_links: usize,
    missing_profile: bool,
    sticky: HashMap<Attribute, Vec<u8>>,
    scripted: HashMap<Attribute, VecDeque<Result<Vec<u8>, String>>>,
    write_errors: HashMap<Attribute, VecDeque<String>>,
    reads: Vec<Attribute>,
    writes: Vec<(Attribute, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct FakeRadio {
    state: Arc<Mutex<FakeState>>,
}

fn encoded<T: Payload>(payload: &T) -> Vec<u8> {
    payload.encode().expect("fake payloads always encode")
}

impl FakeRadio {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_peripheral(self, id: &str, name: &str, rssi: i16) -> Self {
        self.advertise(id, name, rssi);
        self
    }

    /// The adapter never becomes ready
    pub fn unavailable(self, reason: &str) -> Self {
        self.state().unavailable = Some(reason.to_string());
        self
    }

    pub fn with_scan_error(self, reason: &str) -> Self {
        self.state().scan_error = Some(reason.to_string());
        self
    }

    /// Peripherals connect but do not expose the AquariSense service
    pub fn without_profile(self) -> Self {
        self.state().missing_profile = true;
        self
    }

    /// Every connect takes `delay` before it resolves
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state().connect_delay = Some(delay);
        self
    }

    pub fn with_value<T: Payload>(self, attribute: Attribute, payload: &T) -> Self {
        self.set_value(attribute, payload);
        self
    }

    pub fn advertise(&self, id: &str, name: &str, rssi: i16) {
        self.state().advertisements.push(PeripheralHandle {
            id: id.to_string(),
            name: name.to_string(),
            rssi: Some(rssi),
        });
    }

    pub fn set_value<T: Payload>(&self, attribute: Attribute, payload: &T) {
        self.state().sticky.insert(attribute, encoded(payload));
    }

    pub fn push_read<T: Payload>(&self, attribute: Attribute, payload: &T) {
        self.push_raw_read(attribute, encoded(payload));
    }

    pub fn push_raw_read(&self, attribute: Attribute, value: Vec<u8>) {
        self.state().scripted.entry(attribute).or_default().push_back(Ok(value));
    }

    pub fn push_read_error(&self, attribute: Attribute, reason: &str) {
        self.state()
            .scripted
            .entry(attribute)
            .or_default()
            .push_back(Err(reason.to_string()));
    }

    pub fn fail_next_connect(&self, reason: &str) {
        self.state().connect_errors.push_back(reason.to_string());
    }

    pub fn fail_next_write(&self, attribute: Attribute, reason: &str) {
        self.state()
            .write_errors
            .entry(attribute)
            .or_default()
            .push_back(reason.to_string());
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scanning
    }

    pub fn discovered_calls(&self) -> usize {
        self.state().discovered_calls
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn open_links(&self) -> usize {
        self.state().open_links
    }

    pub fn reads(&self, attribute: Attribute) -> usize {
        self.state().reads.iter().filter(|a| **a == attribute).count()
    }

    pub fn total_reads(&self) -> usize {
        self.state().reads.len()
    }

    /// Raw envelopes written to `attribute`, oldest first
    pub fn writes(&self, attribute: Attribute) -> Vec<Vec<u8>> {
        self.state()
            .writes
            .iter()
            .filter(|(a, _)| *a == attribute)
            .map(|(_, value)| value.clone())
            .collect()
    }

    pub fn written<T: Payload>(&self, attribute: Attribute) -> Vec<T> {
        self.writes(attribute)
            .iter()
            .map(|value| T::decode(value).expect("controller writes valid payloads"))
            .collect()
    }
}

#[async_trait]
impl Radio for FakeRadio {
    type Link = FakeLink;

    async fn wait_ready(&self) -> Result<(), ProvisioningError> {
        match &self.state().unavailable {
            Some(reason) => Err(ProvisioningError::ScanUnavailable(reason.clone())),
            None => Ok(()),
        }
    }

    async fn start_scan(&self) -> Result<(), ProvisioningError> {
        let mut state = self.state();
        if let Some(reason) = &state.scan_error {
            return Err(ProvisioningError::ScanUnavailable(reason.clone()));
        }
        state.scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), ProvisioningError> {
        self.state().scanning = false;
        Ok(())
    }

    async fn discovered(&self) -> Result<Vec<PeripheralHandle>, ProvisioningError> {
        let mut state = self.state();
        state.discovered_calls += 1;
        Ok(state.advertisements.clone())
    }

    async fn connect(&self, peripheral: &PeripheralHandle) -> Result<FakeLink, ProvisioningError> {
        let delay = self.state().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.connects += 1;
        if let Some(reason) = state.connect_errors.pop_front() {
            return Err(ProvisioningError::ConnectionFailed(reason));
        }
        if !state.advertisements.iter().any(|p| p.id == peripheral.id) {
            return Err(ProvisioningError::ConnectionFailed(format!("{} not in range", peripheral.id)));
        }
        state.open_links += 1;
        Ok(FakeLink { radio: self.clone(), open: true })
    }
}

pub struct FakeLink {
    radio: FakeRadio,
    open: bool,
}

impl FakeLink {
    fn check_open(&self) -> Result<(), ProvisioningError> {
        if self.open { Ok(()) } else { Err(ProvisioningError::NotReady) }
    }
}

#[async_trait]
impl Link for FakeLink {
    async fn discover(&mut self) -> Result<(), ProvisioningError> {
        self.check_open()?;
        if self.radio.state().missing_profile {
            return Err(ProvisioningError::DiscoveryFailed(
                "service 67fdd12e-9cd6-44b7-8be9-c2570df58644 not found".to_string(),
            ));
        }
        Ok(())
    }

    async fn read(&mut self, attribute: Attribute) -> Result<Vec<u8>, ProvisioningError> {
        self.check_open()?;
        let mut state = self.radio.state();
        state.reads.push(attribute);
        let scripted = state.scripted.get_mut(&attribute).and_then(|queue| queue.pop_front());
        match scripted {
            Some(Ok(value)) => Ok(value),
            Some(Err(reason)) => Err(ProvisioningError::ReadFailed { attribute, reason }),
            None => state.sticky.get(&attribute).cloned().ok_or_else(|| ProvisioningError::ReadFailed {
                attribute,
                reason: "no value".to_string(),
            }),
        }
    }

    async fn write(&mut self, attribute: Attribute, value: &[u8]) -> Result<(), ProvisioningError> {
        self.check_open()?;
        let mut state = self.radio.state();
        if let Some(reason) = state.write_errors.get_mut(&attribute).and_then(|queue| queue.pop_front()) {
            return Err(ProvisioningError::WriteFailed { attribute, reason });
        }
        state.writes.push((attribute, value.to_vec()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ProvisioningError> {
        if std::mem::take(&mut self.open) {
            self.radio.state().open_links -= 1;
        }
        Ok(())
    }
}
