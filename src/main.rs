mod correlator;
mod crc;
mod engine;
mod error;
mod fragment;
mod package;
mod protocol;
mod session;
#[cfg(test)]
mod testutil;
mod transport;
mod transport_btleplug;

use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use crate::session::{SessionCoordinator, TransferConfig};
use crate::transport::DfuTransportManager;
use crate::transport_btleplug::BleManager;

/// Update firmware on nRF BLE DFU targets
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Seconds to scan for peripherals
    #[arg(long, default_value_t = 5)]
    scan_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List peripherals in range with their scan indices
    Scan {},
    /// Start DFU mode on a peripheral using the Buttonless DFU Service
    Trigger {
        /// Peripheral scan index
        index: usize,
    },
    /// Send a DFU package to a peripheral
    Update {
        /// Peripheral scan index
        index: usize,
        /// DFU package path
        pkg: String,
        /// Fragments between packet receipt notifications (0 disables them)
        #[arg(long, default_value_t = 0)]
        prn: u16,
        /// Data channel fragment size in bytes
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u16).range(1..))]
        fragment_size: u16,
        /// Control response timeout in seconds
        #[arg(long, default_value_t = 10)]
        timeout: u64,
        /// Checksum retry budget per object
        #[arg(long, default_value_t = 3)]
        retries: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let manager = BleManager::new(Duration::from_secs(args.scan_secs)).await?;

    match args.command {
        Commands::Scan {} => {
            let found = manager.scan().await?;
            if found.is_empty() {
                println!("no peripherals found");
            }
            for (index, peripheral) in found.iter().enumerate() {
                println!("{index:3}  {peripheral}");
            }
        }
        Commands::Trigger { index } => {
            let transport = manager.connect(index).await?;
            transport.trigger_dfu().await?;
            println!("DFU mode triggered");
        }
        Commands::Update { index, pkg, prn, fragment_size, timeout, retries } => {
            let image = package::extract(&pkg)?;
            let transport = manager.connect(index).await?;
            let config = TransferConfig {
                prn,
                fragment_size: fragment_size as usize,
                request_timeout: Duration::from_secs(timeout),
                max_retries: retries,
            };

            let progress = ProgressBar::new(image.firmware_data.len() as u64);
            progress.set_style(
                ProgressStyle::with_template(
                    "{msg} [{elapsed}] [{wide_bar:.blue/white}] {bytes}/{total_bytes} ({bytes_per_sec})",
                )
                .unwrap()
                .progress_chars("#> "),
            );

            let coordinator = SessionCoordinator::start(transport, config, progress).await?;
            let cancel = coordinator.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("cancel requested, stopping at the next object boundary");
                    cancel.cancel();
                }
            });

            coordinator.transfer_firmware(&image).await?;
            println!("firmware updated");
        }
    }
    Ok(())
}
