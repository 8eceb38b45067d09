mod cli;
mod error;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use moca_config::{Config, SimulatorSection};
use moca_core::sim::SimGateway;
use moca_core::{
    AcaConfig, AcaState, AcaStatus, AssociatedDevice, Controller, ControllerConfig, CoreError,
    DeviceObserver, DriverGateway, IfIndex, MacAddress, NodeId, ObserverError, ScModStats,
};

use crate::cli::{AcaArgs, Cli, Command, RunArgs};
use crate::error::DaemonError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), DaemonError> {
    let path = cli.global.config.unwrap_or_else(moca_config::config_path);
    let (config, controller_config) = load(&path)?;

    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::ShowConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run(args) => serve(&config.simulator, controller_config, &args).await,
        Command::Aca(args) => assess(&config.simulator, controller_config, &args).await,
    }
}

fn load(path: &Path) -> Result<(Config, ControllerConfig), DaemonError> {
    let wrap = |source| DaemonError::Config {
        path: path.display().to_string(),
        source,
    };
    let config = moca_config::load_config_from(path).map_err(wrap)?;
    let controller_config = config.validate().map_err(wrap)?;
    debug!(path = %path.display(), "configuration loaded");
    Ok((config, controller_config))
}

// ── Simulated platform ──────────────────────────────────────────────

fn seeded_device(if_index: IfIndex, node: u32) -> Result<AssociatedDevice, DaemonError> {
    let if_octet = u8::try_from(if_index.get() & 0xFF).unwrap_or_default();
    let node_id = NodeId::new(node).map_err(CoreError::from)?;
    let mac = MacAddress::from_octets([0x02, 0x00, 0x5E, 0x10, if_octet, node_id.get()]);
    Ok(AssociatedDevice::new(mac, node_id))
}

/// Build a simulated gateway with the configured interfaces and devices.
fn platform(
    settings: &SimulatorSection,
) -> Result<(Arc<SimGateway>, Vec<(IfIndex, Vec<AssociatedDevice>)>), DaemonError> {
    let sim = Arc::new(SimGateway::new());
    sim.set_latency(settings.latency());

    let indices = settings
        .interface_indices()
        .map_err(|source| DaemonError::Config {
            path: "simulator".into(),
            source,
        })?;
    let mut seeded = Vec::with_capacity(indices.len());
    for if_index in indices {
        let devices = (1..=settings.devices_per_interface)
            .map(|node| seeded_device(if_index, node))
            .collect::<Result<Vec<_>, _>>()?;
        for device in &devices {
            sim.add_device(if_index, device.clone());
        }
        seeded.push((if_index, devices));
    }
    Ok((sim, seeded))
}

/// Logs every topology change delivered to it.
struct LoggingObserver;

#[async_trait]
impl DeviceObserver for LoggingObserver {
    async fn on_device_event(
        &self,
        if_index: IfIndex,
        device: &AssociatedDevice,
        activated: bool,
    ) -> Result<(), ObserverError> {
        info!(
            %if_index,
            mac = %device.mac,
            node = %device.node_id,
            activated,
            "device {}",
            if activated { "joined" } else { "left" }
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

// ── Commands ────────────────────────────────────────────────────────

async fn serve(
    settings: &SimulatorSection,
    controller_config: ControllerConfig,
    args: &RunArgs,
) -> Result<(), DaemonError> {
    let (sim, seeded) = platform(settings)?;
    let controller = Controller::new(
        Arc::clone(&sim) as Arc<dyn DriverGateway>,
        controller_config,
    );
    controller.start().await?;

    for (if_index, _) in &seeded {
        controller
            .manager(*if_index)?
            .register_observer(Arc::new(LoggingObserver));
    }
    controller.refresh_all().await?;
    for (if_index, _) in &seeded {
        let manager = controller.manager(*if_index)?;
        info!(%if_index, devices = manager.list_devices().len(), "interface up");
    }

    let churner = (!settings.churn_interval().is_zero())
        .then(|| tokio::spawn(churn(Arc::clone(&sim), seeded, settings.churn_interval())));

    match args.duration_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "signal handler failed; shutting down");
            }
        }
    }

    if let Some(handle) = churner {
        handle.abort();
    }
    controller.shutdown().await;
    Ok(())
}

/// Toggle seeded devices one at a time, emitting join and leave events.
async fn churn(
    sim: Arc<SimGateway>,
    seeded: Vec<(IfIndex, Vec<AssociatedDevice>)>,
    period: Duration,
) {
    let slots: Vec<(IfIndex, AssociatedDevice)> = seeded
        .into_iter()
        .flat_map(|(if_index, devices)| devices.into_iter().map(move |d| (if_index, d)))
        .collect();
    if slots.is_empty() {
        return;
    }
    let mut present = vec![true; slots.len()];

    let mut interval = tokio::time::interval(period);
    interval.tick().await; // consume the immediate first tick

    for slot in (0..slots.len()).cycle() {
        interval.tick().await;
        let (if_index, device) = &slots[slot];
        present[slot] = !present[slot];
        let sequence = sim.emit(*if_index, device.clone(), present[slot]);
        debug!(%if_index, mac = %device.mac, sequence, "churn event");
    }
}

async fn assess(
    settings: &SimulatorSection,
    controller_config: ControllerConfig,
    args: &AcaArgs,
) -> Result<(), DaemonError> {
    let deadline = controller_config.aca_deadline;
    let (sim, _) = platform(settings)?;
    let controller = Controller::new(
        Arc::clone(&sim) as Arc<dyn DriverGateway>,
        controller_config,
    );
    let manager = controller.interface(args.interface)?;
    manager.refresh_devices().await?;

    let config = AcaConfig::from_raw(args.node, args.probe, args.channel, args.report_nodes)
        .map_err(CoreError::from)?;
    let mut status = manager.aca_subscribe();
    manager.aca_start(config).await?;

    // The simulated hardware finishes as soon as the session is running.
    sim.complete_aca(manager.if_index(), args.rx_power);

    let state = match tokio::time::timeout(
        deadline + Duration::from_secs(1),
        status.wait_for(|s| s.state.is_terminal()),
    )
    .await
    {
        Ok(Ok(status)) => status.state.clone(),
        Ok(Err(_)) | Err(_) => manager.aca_status().state,
    };

    let result = if state == AcaState::Completed {
        let stats = manager.aca_subcarrier_stats().await?;
        let report = render_report(&manager.aca_status(), &stats)?;
        println!("{report}");
        Ok(())
    } else {
        Err(DaemonError::AcaFailed {
            state: state.to_string(),
        })
    };
    controller.shutdown().await;
    result
}

fn render_report(status: &AcaStatus, stats: &[ScModStats]) -> Result<String, DaemonError> {
    let report = serde_json::json!({
        "config": status.config,
        "state": status.state.to_string(),
        "rx_power": status.rx_power,
        "subcarrier_rows": stats.len(),
        "pairs": stats
            .iter()
            .map(|row| [row.tx_node.get(), row.rx_node.get()])
            .collect::<Vec<_>>(),
    });
    Ok(serde_json::to_string_pretty(&report)?)
}
