//! open-link-hub: control daemon and command-line tool.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use open_link_hub_core::config::{self, Config};
use open_link_hub_core::effect::{EffectKind, EffectState};
use open_link_hub_core::macros::LogSynth;
use open_link_hub_core::profile;
use open_link_hub_core::registry::Registry;
use open_link_hub_core::rgb::RgbProfile;
use open_link_hub_core::store::{FileStore, ProfileStore, PROFILES_DIR};
use open_link_hub_core::temperature::HwmonProvider;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "open-link-hub",
    version,
    about = "Open-source control for Corsair fan hubs, mice, mousepads and PSUs"
)]
struct Cli {
    /// Configuration directory (defaults to ~/.config/open-link-hub).
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
    /// Log at debug level regardless of the config file.
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach every supported device and run until interrupted.
    Run {
        /// tty of an AXi PSU serial dongle; may be repeated.
        #[arg(long)]
        psu_tty: Vec<String>,
    },
    /// List connected supported devices.
    ListDevices,
    /// Print effect frames without touching hardware.
    Preview {
        /// Effect name, e.g. rainbow or colorpulse.
        effect: String,
        #[arg(long, default_value_t = 8)]
        leds: usize,
        #[arg(long, default_value_t = 5)]
        frames: usize,
        /// Brightness slider, 0-100.
        #[arg(long, default_value_t = 100)]
        brightness: u8,
    },
    /// List the stored profiles of a device.
    Profiles {
        /// Device serial number.
        serial: String,
    },
    /// Print the effective configuration.
    ShowConfig,
}

fn init_logging(config: &Config) {
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

async fn run(config: Config, psu_ttys: &[String]) -> Result<()> {
    let store = Arc::new(FileStore::new(config.database_dir()));
    let registry = Registry::new(
        config,
        store,
        Arc::new(HwmonProvider::default()),
        Arc::new(LogSynth),
    )?;
    registry.start().await?;
    let opened = registry.discover().await?;
    for tty in psu_ttys {
        if let Err(e) = registry.open_serial(tty).await {
            warn!(tty = %tty, error = %e, "PSU dongle skipped");
        }
    }
    info!(hid = opened, total = registry.devices().len(), "devices attached");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("interrupt received, shutting down");
    registry.stop_all().await;
    Ok(())
}

fn preview(effect: &str, leds: usize, frames: usize, brightness: u8) -> Result<()> {
    let kind = EffectKind::from_name(effect).ok_or_else(|| {
        let names: Vec<&str> = EffectKind::ALL.iter().map(|k| k.name()).collect();
        anyhow::anyhow!("Unknown effect '{effect}'. Valid effects: {}", names.join(", "))
    })?;
    let slider = f64::from(brightness.min(100)) / 100.0;
    let config = RgbProfile::defaults_for(kind).effect_config(slider);
    let mut state = EffectState::new(kind, config, leds);
    let interval = kind.frame_interval().as_secs_f64();
    for i in 0..frames {
        let t = i as f64 * interval;
        let frame = state.render(t, Some(45.0));
        let row: Vec<String> = frame.iter().map(|c| c.to_hex()).collect();
        println!("{t:7.3}s  {}", row.join(" "));
    }
    Ok(())
}

fn list_profiles(config: &Config, serial: &str) -> Result<()> {
    let store = FileStore::new(config.database_dir());
    let names: Vec<String> = store
        .list(PROFILES_DIR)?
        .iter()
        .filter_map(|base| profile::profile_name(serial, base))
        .collect();
    if names.is_empty() {
        println!("No profiles stored for {serial}.");
    } else {
        for name in names {
            println!("{name}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let dir = cli.config_dir.unwrap_or_else(config::default_config_dir);
    let mut config =
        Config::load(&dir).with_context(|| format!("loading config from {}", dir.display()))?;
    config.debug |= cli.debug;
    init_logging(&config);

    match cli.command {
        Commands::Run { psu_tty } => run(config, &psu_tty).await?,
        Commands::ListDevices => {
            let devices = open_link_hub_core::device::discover_devices()?;
            if devices.is_empty() {
                println!("No supported devices found.");
                println!("Ensure the device is connected and the udev rules are installed.");
            } else {
                for dev in &devices {
                    println!(
                        "{} (VID: 0x{:04X}, PID: 0x{:04X}, serial: {}, path: {})",
                        dev.descriptor.name,
                        dev.descriptor.vendor_id,
                        dev.descriptor.product_id,
                        dev.serial.as_deref().unwrap_or("-"),
                        dev.path
                    );
                }
            }
        }
        Commands::Preview {
            effect,
            leds,
            frames,
            brightness,
        } => preview(&effect, leds, frames, brightness)?,
        Commands::Profiles { serial } => list_profiles(&config, &serial)?,
        Commands::ShowConfig => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
