//! Surface hub CLI
//!
//! Attaches emulator panels from the config file to a surface controller and
//! logs the listing patches it publishes.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use surface_transport::{EmulatorDiscovery, MonitorConfig, MonitorFilter};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use surface_hub::{
    HubConfig, HubEvent, LoggingDispatch, MemoryRenderer, SledStore, SurfaceController,
    SurfaceStore,
};

mod cli;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(HubConfig::default_path);
    let config = HubConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    match cli.command {
        None | Some(Commands::List) => list(&config).await,
        Some(Commands::Run {
            monitor,
            payload,
            filter,
        }) => {
            let monitor = if monitor {
                let filter: MonitorFilter = filter.parse().map_err(anyhow::Error::msg)?;
                Some(
                    MonitorConfig::default()
                        .with_filter(filter)
                        .with_payload(payload),
                )
            } else {
                None
            };
            run(&config, monitor).await
        }
        Some(Commands::Reset) => reset(&config).await,
        Some(Commands::DefaultConfig) => {
            print!("{}", toml::to_string_pretty(&HubConfig::default())?);
            Ok(())
        }
    }
}

fn open_store(config: &HubConfig) -> anyhow::Result<SurfaceStore> {
    let path = config.store.resolved_path();
    let store = SledStore::open(&path)
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    Ok(SurfaceStore::new(Arc::new(store)))
}

fn controller(config: &HubConfig) -> anyhow::Result<Arc<SurfaceController>> {
    Ok(SurfaceController::new(
        open_store(config)?,
        Arc::new(MemoryRenderer::new()),
        Arc::new(LoggingDispatch),
        config,
    ))
}

async fn run(config: &HubConfig, monitor: Option<MonitorConfig>) -> anyhow::Result<()> {
    let controller = controller(config)?;

    let discovery = Arc::new(match monitor {
        Some(monitor) => {
            info!("Monitor mode enabled - logging all driver traffic");
            EmulatorDiscovery::with_monitor(monitor)
        }
        None => EmulatorDiscovery::new(),
    });
    controller.add_discovery(discovery.clone());

    let observer = tokio::spawn(log_patches(controller.subscribe()));

    for spec in &config.emulators {
        discovery.add_emulator(spec.clone());
    }
    controller.scan().await;
    info!(
        "Serving {} surfaces in {} groups",
        controller.handlers().len(),
        controller.devices_list().len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    controller.quit().await;
    observer.abort();
    Ok(())
}

async fn log_patches(mut events: broadcast::Receiver<HubEvent>) {
    loop {
        match events.recv().await {
            Ok(HubEvent::SurfacesPatch(ops)) => match serde_json::to_string(&ops) {
                Ok(json) => info!("Surfaces patch: {}", json),
                Err(e) => warn!("Unprintable patch: {}", e),
            },
            Ok(HubEvent::PageChanged { surface_id, page }) => {
                info!("{} -> page {}", surface_id, page)
            }
            Ok(HubEvent::LockChanged { surface_id, locked }) => {
                info!("{} {}", surface_id, if locked { "locked" } else { "unlocked" })
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Dropped {} hub events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn list(config: &HubConfig) -> anyhow::Result<()> {
    let controller = controller(config)?;
    let groups = controller.devices_list();
    println!("{}", serde_json::to_string_pretty(&groups)?);
    controller.quit().await;
    Ok(())
}

async fn reset(config: &HubConfig) -> anyhow::Result<()> {
    let controller = controller(config)?;
    controller.reset().await?;
    controller.quit().await;
    println!("Surface configuration erased");
    Ok(())
}
