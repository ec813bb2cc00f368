//! Command-line front end for downloading oximeter reports.
//!
//! ```bash
//! # List serial ports
//! oxilink ports
//!
//! # Find the device
//! oxilink scan
//!
//! # Download everything it holds
//! oxilink download --out reports.json
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use oxilink_lib::device::manager::summarize;
use oxilink_lib::{
    DeviceManager, DownloadEvent, DownloadOutcome, PortCandidate, ScanOutcome, Settings,
};

#[derive(Parser)]
#[command(name = "oxilink")]
#[command(version)]
#[command(about = "Download stored reports from a USB-serial pulse oximeter")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Override the line speed
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Only consider USB serial ports
    #[arg(long, global = true)]
    usb_only: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List candidate serial ports
    Ports,

    /// Look for the device on every port
    Scan,

    /// Download all stored reports
    Download {
        /// Connect to this port instead of scanning
        #[arg(short, long)]
        port: Option<String>,

        /// Write the full reports as JSON to this file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let settings = load_settings(&cli)?;
    let manager = DeviceManager::with_serial(settings);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted");
            ctrl_c.cancel();
        }
    });

    let result = match cli.command {
        Commands::Ports => list_ports(&manager),
        Commands::Scan => scan(&manager, &cancel).await.map(|_| ()),
        Commands::Download { port, out } => download(&manager, &cancel, port, out).await,
    };

    manager.session().shutdown().await;
    result
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(baud) = cli.baud {
        settings.baud_rate = baud;
    }
    if cli.usb_only {
        settings.usb_only = true;
    }
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

fn list_ports(manager: &DeviceManager) -> Result<()> {
    let ports = manager.discover_ports().context("Failed to enumerate ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!("{}  [{:04x}:{:04x}]", port, vid, pid),
            _ => println!("{}", port),
        }
    }
    Ok(())
}

async fn scan(manager: &DeviceManager, cancel: &CancellationToken) -> Result<Option<PortCandidate>> {
    let outcome = manager
        .scan_for_device(None, cancel)
        .await
        .context("Scan failed")?;
    match outcome {
        ScanOutcome::DeviceFound(port) => {
            println!("Device found on {}", port);
            Ok(Some(port))
        }
        ScanOutcome::NoDeviceFound => {
            println!("No device found");
            Ok(None)
        }
        ScanOutcome::Canceled => Ok(None),
    }
}

async fn download(
    manager: &DeviceManager,
    cancel: &CancellationToken,
    port: Option<String>,
    out: Option<PathBuf>,
) -> Result<()> {
    match port {
        Some(name) => {
            let port = PortCandidate::new(name);
            manager
                .connect(&port)
                .await
                .with_context(|| format!("Failed to connect to {}", port))?;
        }
        None => {
            if scan(manager, cancel).await?.is_none() {
                return Ok(());
            }
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                DownloadEvent::ReportCount(count) => println!("{} report(s) on device", count),
                DownloadEvent::HeaderReceived { number } => log::debug!("Header {} received", number),
                DownloadEvent::ReportDownloaded(report) => println!("Report {} downloaded", report.number),
                DownloadEvent::Failed { number, error } => eprintln!("Report {} failed: {}", number, error),
            }
        }
    });

    let summary = manager
        .download_reports(cancel, Some(tx))
        .await
        .context("Download failed")?;
    let _ = progress.await;

    let summaries = summarize(&summary.reports);
    println!("{}", serde_json::to_string_pretty(&summaries)?);

    match &summary.outcome {
        DownloadOutcome::Completed => println!(
            "Downloaded {}/{} report(s)",
            summary.completed, summary.available
        ),
        DownloadOutcome::Canceled => println!(
            "Canceled after {}/{} report(s)",
            summary.completed, summary.available
        ),
        DownloadOutcome::Interrupted(reason) => println!(
            "Interrupted after {}/{} report(s): {}",
            summary.completed, summary.available, reason
        ),
    }

    if let Some(path) = out {
        let json = serde_json::to_string_pretty(&summary.reports)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Wrote {} report(s) to {}", summary.reports.len(), path.display());
    }

    if manager.connected_port().await.is_some() {
        manager.disconnect().await.context("Failed to disconnect")?;
    }
    Ok(())
}
