//! srctl - Short-Range Module Control

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use short_range::{
    BtStatusEvent, ConnectionStatus, DataEvent, InstanceHandle, ShortRange, SpsStatusEvent,
};
use short_range_serial::{init_logging, SerialAtClient, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(name = "srctl")]
#[command(about = "Drive a short-range radio module over a serial port", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Serial device, overrides the settings file
    #[arg(short, long)]
    port: Option<String>,
    /// Baud rate, overrides the settings file
    #[arg(short, long)]
    baud: Option<u32>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the module answers
    Ping,
    /// Read the BLE role
    Role,
    /// Write the configured BLE role and restart the module
    Configure,
    /// Return to command mode with the escape sequence
    Recover,
    /// Open an SPS link, optionally send a message, print what arrives
    Connect {
        address: String,
        #[arg(short, long)]
        message: Option<String>,
        /// Send through data mode instead of AT writes
        #[arg(long)]
        data_mode: bool,
        /// Seconds to wait for the link and then listen
        #[arg(short, long, default_value = "10")]
        wait: u64,
    },
    /// Print link status and data events
    Monitor {
        #[arg(short, long, default_value = "30")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(baud) = cli.baud {
        settings.baud_rate = Some(baud);
    }
    init_logging(&settings.log_level)?;
    info!("=== srctl v{} ===", env!("CARGO_PKG_VERSION"));

    let client = Arc::new(SerialAtClient::new());
    let transport = client.open(&settings.port, settings.effective_baud_rate())?;
    let driver = ShortRange::with_config(client.clone(), settings.driver.clone());
    driver.init().await?;
    client.set_event_sink(driver.event_sink());
    let instance = driver.add(settings.module, transport)?;

    let outcome = run(&driver, instance, cli.command).await;
    driver.deinit().await;
    outcome
}

async fn run(driver: &ShortRange, instance: InstanceHandle, command: Commands) -> Result<()> {
    match command {
        Commands::Ping => {
            driver.attention(instance).await?;
            println!("OK");
        }
        Commands::Role => {
            let role = driver.check_ble_role(instance).await?;
            println!("BLE role: {:?}", role);
        }
        Commands::Configure => {
            driver.configure(instance).await?;
            println!("Configured as {:?}", driver.config().ble_role);
        }
        Commands::Recover => {
            let transport = driver.enter_command_mode(instance).await?;
            println!("Command mode on {}", transport);
        }
        Commands::Connect {
            address,
            message,
            data_mode,
            wait,
        } => cmd_connect(driver, instance, &address, message, data_mode, wait).await?,
        Commands::Monitor { seconds } => cmd_monitor(driver, instance, seconds).await?,
    }
    Ok(())
}

async fn cmd_connect(
    driver: &ShortRange,
    instance: InstanceHandle,
    address: &str,
    message: Option<String>,
    data_mode: bool,
    wait: u64,
) -> Result<()> {
    let (tx, mut status) = mpsc::unbounded_channel();
    driver.set_sps_status_callback(instance, move |_, event: &SpsStatusEvent| {
        let _ = tx.send(event.clone());
    })?;
    driver.set_data_callback(instance, |_, event: &DataEvent| {
        println!("<- {}", String::from_utf8_lossy(&event.payload));
    })?;

    let conn = driver.connect_sps(instance, address).await?;
    let window = Duration::from_secs(wait);
    let outcome = tokio::time::timeout(window, async {
        while let Some(event) = status.recv().await {
            if event.conn == conn {
                return Some(event.status);
            }
        }
        None
    })
    .await;
    if !matches!(outcome, Ok(Some(ConnectionStatus::Connected))) {
        driver.disconnect(instance, conn).await?;
        bail!("{} did not connect within {}s", address, wait);
    }
    println!("Connected to {} as connection {}", address, conn);

    if data_mode {
        driver.enter_data_mode(instance).await?.settle().await;
    }
    if let Some(message) = message {
        driver.send(instance, conn, message.as_bytes()).await?;
        println!("-> {}", message);
    }
    tokio::time::sleep(window).await;

    if data_mode {
        driver.enter_command_mode(instance).await?;
    }
    driver.disconnect(instance, conn).await?;
    Ok(())
}

async fn cmd_monitor(driver: &ShortRange, instance: InstanceHandle, seconds: u64) -> Result<()> {
    driver.set_bt_status_callback(instance, |_, event: &BtStatusEvent| {
        let state = if event.connected { "up" } else { "down" };
        match event.address {
            Some(address) => println!("BT link {} {} ({})", event.link, state, address),
            None => println!("BT link {} {}", event.link, state),
        }
    })?;
    driver.set_sps_status_callback(instance, |_, event: &SpsStatusEvent| {
        println!("SPS connection {} {} ({})", event.conn, event.status, event.address);
    })?;
    driver.set_data_callback(instance, |_, event: &DataEvent| {
        println!("<- {} bytes", event.payload.len());
    })?;

    tokio::time::sleep(Duration::from_secs(seconds)).await;
    Ok(())
}
