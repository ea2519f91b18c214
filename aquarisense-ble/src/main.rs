//! BLE provisioning tool for AquariSense devices
//!
//! Finds an AquariSense over BLE, lists the Wi-Fi networks it can see and
//! sends it credentials for one of them.

use std::time::Duration;

use aquarisense_ble_controller::btle::BtleRadio;
use aquarisense_ble_controller::{ProvisioningConfig, ProvisioningSession, Radio, Scanner, Stage};
use aquarisense_proto::{NetworkDescriptor, SerialNumber, SignalStrength};
use clap::{Parser, Subcommand};
use log::debug;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "aquarisense-ble")]
#[command(about = "BLE provisioning tool for AquariSense devices")]
struct Cli {
    /// Fragment of the advertised name to look for
    #[arg(long, global = true, env = "AQUARISENSE_FILTER", default_value = aquarisense_proto::ble::ADVERTISED_NAME)]
    filter: String,

    /// Scan duration in seconds
    #[arg(long, global = true, env = "AQUARISENSE_SCAN_TIMEOUT", default_value = "30")]
    scan_timeout: u64,

    /// Network status checks before giving up on a join
    #[arg(long, global = true, env = "AQUARISENSE_STATUS_ATTEMPTS", default_value = "30")]
    status_attempts: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List AquariSense devices in range
    Scan,
    /// Connect to the first device found and list the networks it can see
    Networks,
    /// Send WiFi credentials to a device and wait for it to join
    Provision {
        /// WiFi credentials file (SSID on line 1, password on line 2)
        #[arg(short, long, default_value = "wifi_credentials.txt")]
        file: String,
        /// Join this network instead of the one named in the file
        #[arg(short, long)]
        ssid: Option<String>,
    },
    /// Give a device a new display name
    Rename {
        /// New name, e.g. "Living Room Tank"
        name: String,
    },
    /// Check a serial number typed by hand
    Serial {
        /// Serial as typed, dashes optional
        input: String,
    },
}

impl Cli {
    fn config(&self) -> ProvisioningConfig {
        ProvisioningConfig {
            name_filter: self.filter.clone(),
            scan_timeout: Duration::from_secs(self.scan_timeout),
            status_max_attempts: self.status_attempts,
            ..ProvisioningConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config();

    match cli.command {
        Commands::Serial { input } => check_serial(&input)?,
        Commands::Scan => scan_devices(&config).await?,
        Commands::Networks => {
            let session = open_session(config).await?;
            print_networks(session.stage().networks());
            session.close().await;
        }
        Commands::Provision { file, ssid } => {
            let (file_ssid, password) = read_wifi_credentials(&file)?;
            let ssid = ssid.unwrap_or(file_ssid);
            let mut session = open_session(config).await?;
            let result = provision_device(&mut session, &ssid, password).await;
            session.close().await;
            result?;
        }
        Commands::Rename { name } => {
            let mut session = open_session(config).await?;
            let result = session.rename_device(&name).await;
            session.close().await;
            let renamed = result?;
            println!("{} is now called {:?}", renamed.id, renamed.name);
        }
    }

    Ok(())
}

/// Cancels `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nCancelling...");
            token.cancel();
        }
    });
}

fn parse_wifi_credentials(content: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    let mut lines = content.lines();
    let ssid = lines.next().ok_or("Missing SSID in credentials file")?.trim().to_string();
    let password = lines.next().ok_or("Missing password in credentials file")?.trim().to_string();
    Ok((ssid, password))
}

fn read_wifi_credentials(file: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(file)?;
    parse_wifi_credentials(&content)
}

fn check_serial(input: &str) -> Result<(), Box<dyn std::error::Error>> {
    let formatted = aquarisense_proto::format_serial_input(input);
    let serial: SerialNumber = formatted.parse()?;
    println!("{serial}");
    println!("  Region: {}", serial.region());
    println!("  Model:  M{:02}", serial.model());
    println!("  Year:   20{:02}", serial.year());
    println!("  Unit:   {}", serial.unit());
    Ok(())
}

async fn scan_devices(config: &ProvisioningConfig) -> Result<(), Box<dyn std::error::Error>> {
    let radio = BtleRadio::new().await?;
    radio.wait_ready().await?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    println!("Scanning for AquariSense devices ({} seconds)...", config.scan_timeout.as_secs());
    let scan = Scanner::new(&radio, &config.name_filter, config.scan_timeout)
        .with_poll_interval(config.scan_poll_interval)
        .start(cancel)
        .await?;
    let devices = scan.collect().await;

    println!("\nFound {} devices:", devices.len());
    for device in devices {
        let rssi = device.rssi.map(|r| format!("{} dBm", r)).unwrap_or_else(|| "N/A".to_string());
        println!("  {} ({}) RSSI: {}", device.name, device.id, rssi);
    }
    Ok(())
}

/// Scans, connects to the first device found and reads its networks
async fn open_session(
    config: ProvisioningConfig,
) -> Result<ProvisioningSession<BtleRadio>, Box<dyn std::error::Error>> {
    let radio = BtleRadio::new().await?;
    let mut session = ProvisioningSession::new(radio, config);
    cancel_on_ctrl_c(session.cancellation_token());

    println!("Scanning for AquariSense devices...");
    session.start().await?;

    match session.stage() {
        Stage::Cancelled => return Err("Cancelled".into()),
        Stage::Scanning { awaiting_retry: true } => return Err("No AquariSense device found".into()),
        _ => {}
    }
    if let Some(identity) = session.stage().identity() {
        println!("Connected to {}", identity.id);
        match identity.serial_number() {
            Ok(serial) => println!("  Model M{:02}, built 20{:02}", serial.model(), serial.year()),
            Err(e) => debug!("unrecognised serial {}: {e}", identity.id),
        }
    }
    Ok(session)
}

fn print_networks(networks: &[NetworkDescriptor]) {
    println!("\n{} networks visible:", networks.len());
    for network in networks {
        let strength = match network.strength() {
            SignalStrength::Strong => "strong",
            SignalStrength::Fair => "fair",
            SignalStrength::Weak => "weak",
        };
        let lock = if network.secure { " [secured]" } else { "" };
        println!("  {} ({} dBm, {}){}", network.ssid, network.signal, strength, lock);
    }
}

async fn provision_device(
    session: &mut ProvisioningSession<BtleRadio>,
    ssid: &str,
    password: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let network = session
        .stage()
        .networks()
        .iter()
        .find(|n| n.ssid == ssid)
        .cloned()
        .ok_or_else(|| format!("{ssid} is not visible to the device"))?;
    session.select_network(network).await?;

    println!("Sending WiFi credentials...");
    println!("  SSID: {}", ssid);

    let mut progress = session.subscribe();
    let reporter = tokio::spawn(async move {
        let mut shown = 0;
        while progress.changed().await.is_ok() {
            let attempts = progress.borrow_and_update().attempt_count;
            if attempts > shown {
                shown = attempts;
                println!("Waiting for the device to join... ({attempts})");
            }
        }
    });
    let result = session.submit_password(password).await;
    reporter.abort();
    result?;

    match session.stage() {
        Stage::Done { ssid, ip, .. } => {
            println!(
                "Device joined {} with address {}",
                ssid.as_deref().unwrap_or("the network"),
                ip.as_deref().unwrap_or("unknown")
            );
            Ok(())
        }
        _ => Err("Cancelled".into()),
    }
}
