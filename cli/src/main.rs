// blebridge: BLE sensor notifications in, LED commands out
//
// Connects to one peripheral, subscribes to its sensor characteristic and
// writes a blink command back for every reading until Ctrl-C.

mod btle;
mod config;

use anyhow::{Context, Result};
use blebridge_core::{
    BridgeConfig, BridgeStats, BridgeSupervisor, CharacteristicId, DeviceSelector,
};
use clap::{ArgGroup, Parser};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "blebridge")]
#[command(about = "Bridge BLE sensor notifications to LED commands", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("device").required(true).args(["name", "address"])))]
struct Cli {
    /// Advertised name of the peripheral
    #[arg(long)]
    name: Option<String>,

    /// Hardware address of the peripheral (or the platform peripheral id)
    #[arg(long)]
    address: Option<String>,

    /// Characteristic that notifies sensor readings (full or short UUID)
    notify_uuid: String,

    /// Characteristic that receives LED commands (full or short UUID)
    command_uuid: String,

    /// Match the hardware address rather than the CoreBluetooth peripheral id
    #[arg(long)]
    macos_use_bdaddr: bool,

    /// Verbose logging
    #[arg(short, long)]
    debug: bool,

    /// Settings file (JSON)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Capacity of the notification and command queues
    #[arg(long, value_name = "N")]
    queue_capacity: Option<usize>,

    /// gx threshold above which the LED blinks for one second
    #[arg(long, value_name = "F")]
    threshold: Option<f64>,

    /// Minimum spacing between LED writes once the burst is used up
    #[arg(long, value_name = "MS")]
    min_write_interval_ms: Option<u64>,

    /// Also write JSON logs to a daily rotating file in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn selector(&self) -> Result<DeviceSelector> {
        match (&self.name, &self.address) {
            (Some(name), None) => Ok(DeviceSelector::Name(name.clone())),
            (None, Some(address)) => Ok(DeviceSelector::Address(address.clone())),
            _ => anyhow::bail!("exactly one of --name or --address is required"),
        }
    }

    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            queue_capacity: self.queue_capacity,
            threshold: self.threshold,
            min_write_interval_ms: self.min_write_interval_ms,
        }
    }

    fn bridge_config(&self) -> Result<BridgeConfig> {
        let (settings, source) = config::load_settings(self.config.as_deref())?;
        if let Some(path) = source {
            tracing::info!("Loaded settings from {}", path.display());
        }
        let settings = self.overrides().apply(settings)?;

        let notify: CharacteristicId = self
            .notify_uuid
            .parse()
            .with_context(|| format!("Invalid notify characteristic '{}'", self.notify_uuid))?;
        let command: CharacteristicId = self
            .command_uuid
            .parse()
            .with_context(|| format!("Invalid command characteristic '{}'", self.command_uuid))?;

        let config = BridgeConfig::new(self.selector()?, notify, command)
            .with_platform_address_mode(self.macos_use_bdaddr)
            .with_settings(settings);
        config.validate()?;
        Ok(config)
    }
}

/// Console logging, plus JSON file logging when `log_dir` is set.
/// The returned guard must live until exit so buffered lines are flushed.
fn init_tracing(debug: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let console = fmt::layer().with_target(debug);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "blebridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().json().with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            Ok(None)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.debug, cli.log_dir.as_deref())?;

    let config = cli.bridge_config()?;

    println!("{}", "blebridge".bold());
    println!("  {} {}", "Device:".bright_black(), config.selector);
    println!(
        "  {} {}",
        "Notify:".bright_black(),
        config.notify_characteristic
    );
    println!(
        "  {} {}",
        "Command:".bright_black(),
        config.command_characteristic
    );
    println!();

    let transport = btle::BtleplugTransport::new()
        .await
        .context("Bluetooth is not available")?;
    let supervisor = BridgeSupervisor::new(config, Arc::new(transport))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        println!();
        println!("{}", "Shutting down...".yellow());
    };

    match supervisor.run_until(shutdown).await {
        Ok(stats) => {
            print_stats(&stats);
            Ok(())
        }
        Err(e) if e.is_device_not_found() => {
            eprintln!("{} {}", "✗".red(), e);
            eprintln!(
                "  Is the peripheral powered and advertising? Try {} for details.",
                "--debug".bold()
            );
            Err(e.into())
        }
        Err(e) => Err(anyhow::Error::new(e).context("Bridge failed to start")),
    }
}

fn print_stats(stats: &BridgeStats) {
    println!("{}", "Bridge stopped".green().bold());
    println!("  Notifications:  {}", stats.notifications_received);
    println!("  Readings:       {}", stats.readings_decoded);
    println!("  Control msgs:   {}", stats.control_messages);
    println!("  Commands sent:  {}", stats.commands_dispatched);
    if stats.commands_failed > 0 {
        println!("  Commands lost:  {}", stats.commands_failed.to_string().red());
    }
    if stats.commands_abandoned > 0 {
        println!(
            "  Abandoned:      {}",
            stats.commands_abandoned.to_string().yellow()
        );
    }
    if stats.total_dropped() > 0 {
        println!(
            "  Dropped:        {} ({} malformed, {} queue full)",
            stats.total_dropped().to_string().yellow(),
            stats.dropped_malformed,
            stats.dropped_backpressure
        );
    }
    println!("  Reconnects:     {}", stats.reconnects);
}
