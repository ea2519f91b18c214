//! AquariSense BLE Controller
//!
//! BLE client for provisioning AquariSense aquarium monitors onto a Wi-Fi
//! network.
//!
//! # Example
//!
//! ```ignore
//! use aquarisense_ble_controller::{ProvisioningConfig, ProvisioningSession, btle::BtleRadio};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let radio = BtleRadio::new().await?;
//!     let mut session = ProvisioningSession::new(radio, ProvisioningConfig::default());
//!
//!     // Scan, connect and list the networks the appliance can see
//!     session.start().await?;
//!     let network = session.stage().networks()[0].clone();
//!
//!     // Join the first one
//!     session.select_network(network).await?;
//!     session.submit_password("secret123".to_string()).await?;
//!
//!     session.close().await;
//!     Ok(())
//! }
//! ```

pub mod btle;
mod config;
mod connection;
mod error;
#[cfg(any(test, feature = "fake"))]
pub mod fake;
mod poller;
mod scanner;
mod session;
mod stage;
mod transport;

pub use aquarisense_proto;
pub use config::ProvisioningConfig;
pub use connection::{Connection, ConnectionManager};
pub use error::ProvisioningError;
pub use poller::StatusPoller;
pub use scanner::{Scan, Scanner};
pub use session::{ProvisioningSession, Snapshot};
pub use stage::{Event, Stage, transition};
pub use transport::{Link, PeripheralHandle, Radio};
