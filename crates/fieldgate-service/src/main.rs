//! Fieldgate - field telemetry gateway.
//!
//! Run with: `cargo run -p fieldgate-service`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tracing::info;

use fieldgate_core::{MeterClient, SerialTransport};
use fieldgate_service::{AppState, Config, build_supervisor, config::default_config_path, uploader};
use fieldgate_store::{RecordQuery, Store};
use fieldgate_types::{Device, DeviceKind};

/// Fieldgate - polls field-bus meters, receives weather data and uploads it.
#[derive(Parser, Debug)]
#[command(name = "fieldgate")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides config).
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway in the foreground (default behavior).
    Run,

    /// Write a default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Create the database and its schema.
    InitDb,

    /// Register or update a device.
    RegisterDevice {
        /// Unique device id.
        id: String,
        /// Device kind: meter, weather or other.
        #[arg(long, default_value = "meter")]
        kind: DeviceKind,
        /// Display name.
        #[arg(long)]
        name: String,
        /// Field-bus address (meters only).
        #[arg(long)]
        address: Option<u8>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Register the device disabled.
        #[arg(long)]
        disabled: bool,
    },

    /// List registered devices.
    Devices,

    /// Read one meter once and print the decoded values.
    Read {
        /// Field-bus address of the meter.
        address: u8,
    },

    /// List stored records, newest first.
    Records {
        /// Only records of this device.
        #[arg(long)]
        device: Option<String>,
        /// Only records of this device kind.
        #[arg(long)]
        kind: Option<DeviceKind>,
        /// Only records not yet uploaded.
        #[arg(long)]
        pending: bool,
        /// Records at or after this RFC 3339 time.
        #[arg(long, value_parser = parse_timestamp)]
        since: Option<OffsetDateTime>,
        /// Records strictly before this RFC 3339 time.
        #[arg(long, value_parser = parse_timestamp)]
        until: Option<OffsetDateTime>,
        /// Maximum number of records shown.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Run one upload cycle now.
    Upload,

    /// Delete uploaded records older than the retention age.
    Cleanup {
        /// Age threshold in days (defaults to the configured retention).
        #[arg(long)]
        days: Option<u32>,
        /// Report what would be deleted without deleting.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show pending and uploaded record counts.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fieldgate_service=info".parse()?)
                .add_directive("fieldgate_core=info".parse()?),
        )
        .init();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    if let Some(Command::InitConfig { force }) = &args.command {
        return init_config(&config_path, *force);
    }

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    if let Some(db_path) = args.database {
        config.storage.path = db_path;
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run_gateway(config).await,
        Command::InitConfig { .. } => Ok(()),
        Command::InitDb => {
            open_store(&config)?;
            println!("Database ready at {}", config.storage.path.display());
            Ok(())
        }
        Command::RegisterDevice {
            id,
            kind,
            name,
            address,
            model,
            location,
            description,
            disabled,
        } => {
            let mut device = Device::new(id, kind, name);
            device.address = address;
            device.model = model;
            device.location = location;
            device.description = description;
            device.enabled = !disabled;

            open_store(&config)?.register_device(&device)?;
            println!("Registered {} device {}", device.kind, device.id);
            Ok(())
        }
        Command::Devices => list_devices(&config),
        Command::Read { address } => read_meter(&config, address).await,
        Command::Records {
            device,
            kind,
            pending,
            since,
            until,
            limit,
        } => {
            let mut query = RecordQuery::new().limit(limit);
            if let Some(device) = &device {
                query = query.device(device);
            }
            if let Some(kind) = kind {
                query = query.kind(kind);
            }
            if pending {
                query = query.pending();
            }
            if let Some(since) = since {
                query = query.since(since);
            }
            if let Some(until) = until {
                query = query.before(until);
            }
            list_records(&config, &query)
        }
        Command::Upload => upload_once(config).await,
        Command::Cleanup { days, dry_run } => {
            let days = days.unwrap_or(config.retention.days);
            let store = Arc::new(Mutex::new(open_store(&config)?));
            let report = uploader::cleanup(&store, days, dry_run).await?;

            for stats in &report.kinds {
                println!("{:<8} {:>8} record(s)", stats.kind, stats.records);
            }
            let verb = if dry_run { "Would delete" } else { "Deleted" };
            println!(
                "{} {} uploaded record(s) older than {} days",
                verb, report.total, days
            );
            Ok(())
        }
        Command::Stats => print_stats(&config),
    }
}

fn parse_timestamp(s: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(s, &Rfc3339).map_err(|e| format!("expected an RFC 3339 time: {e}"))
}

fn open_store(config: &Config) -> anyhow::Result<Store> {
    Store::open(&config.storage.path)
        .with_context(|| format!("failed to open database {}", config.storage.path.display()))
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn run_gateway(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    let store = open_store(&config)?;
    let stop_timeout = config.supervisor.stop_timeout();

    info!("Database: {}", config.storage.path.display());
    let state = AppState::new(store, config);
    let supervisor = build_supervisor(state).await?;
    supervisor.start().await?;

    let clean = supervisor.run_until_signal(stop_timeout).await;
    if clean {
        info!("All services stopped");
    } else {
        tracing::warn!("Some services did not stop within {:?}", stop_timeout);
    }
    Ok(())
}

fn list_devices(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let devices = store.list_devices()?;
    if devices.is_empty() {
        println!("No devices registered");
        return Ok(());
    }

    for stored in devices {
        let device = &stored.device;
        let address = device
            .address
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = match (device.enabled, stored.online) {
            (false, _) => "disabled",
            (true, true) => "online",
            (true, false) => "offline",
        };
        println!(
            "{:<20} {:<8} {:>4}  {:<9} errors={} {}",
            device.id, device.kind, address, state, stored.error_count, device.name
        );
    }
    Ok(())
}

fn list_records(config: &Config, query: &RecordQuery) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let records = store.query_records(query)?;
    if records.is_empty() {
        println!("No matching records");
        return Ok(());
    }

    for record in records {
        let at = record
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| record.timestamp.to_string());
        println!(
            "{:>8} {:<20} {:<8} {}  {}",
            record.id, record.device_id, record.kind, at, record.payload
        );
    }
    Ok(())
}

async fn read_meter(config: &Config, address: u8) -> anyhow::Result<()> {
    if let Ok(store) = open_store(config)
        && let Some(stored) = store.get_device_by_address(address)?
    {
        println!("Device:  {} ({})", stored.device.id, stored.device.name);
    }

    let transport = SerialTransport::open(config.meters.serial_config())
        .with_context(|| format!("failed to open serial port {}", config.meters.port))?;
    let client = MeterClient::with_options(
        address,
        Arc::new(Mutex::new(transport)),
        config.meters.client_options(),
    );

    let reading = client.read_meter().await?;
    println!("Voltage: {:.2} V", reading.voltage);
    println!("Current: {:.3} A", reading.current);
    println!("Power:   {:.2} W", reading.power);
    println!("Energy:  {:.4} kWh", reading.energy);
    if reading.alarm_high || reading.alarm_low {
        println!(
            "Alarms:  high={} low={}",
            reading.alarm_high, reading.alarm_low
        );
    }
    if reading.power_substituted {
        println!("Note: power register was implausible, shown as V x I");
    }
    Ok(())
}

async fn upload_once(config: Config) -> anyhow::Result<()> {
    anyhow::ensure!(
        config.upload.enabled,
        "uploads are disabled in the configuration"
    );
    config.validate()?;
    let store = Arc::new(Mutex::new(open_store(&config)?));
    let uploader = uploader::Uploader::new(store, config.upload, config.retention)?;

    let report = uploader.run_cycle().await?;
    println!("Pending at start: {}", report.pending);
    for kind in &report.succeeded {
        println!("{:<8} uploaded", kind);
    }
    for kind in &report.failed {
        println!("{:<8} failed", kind);
    }
    if let Some(cleanup) = report.cleanup {
        println!("Cleaned up {} record(s)", cleanup.total);
    }
    Ok(())
}

fn print_stats(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let now = OffsetDateTime::now_utc();

    println!("{:<8} {:>10} {:>10}  oldest uploaded", "kind", "pending", "uploaded");
    for stats in store.cleanup_stats()? {
        let age = stats
            .oldest_uploaded
            .map(|ts| format!("{} days ago", (now - ts).whole_days()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<8} {:>10} {:>10}  {}",
            stats.kind, stats.pending, stats.uploaded, age
        );
    }

    let recent = store.recent_upload_logs(5)?;
    if !recent.is_empty() {
        println!();
        println!("Recent uploads:");
        for entry in recent {
            println!(
                "  {} {:<7} {:>5} record(s) {}",
                entry.log.batch_id,
                entry.log.status.as_str(),
                entry.log.record_count,
                entry.log.error_message.as_deref().unwrap_or("")
            );
        }
    }

    for kind in DeviceKind::ALL {
        if kind.is_polled() {
            let enabled = store.list_enabled_devices(Some(kind))?.len();
            println!();
            println!("Enabled {} devices: {}", kind, enabled);
        }
    }
    Ok(())
}
