//! ---
//! tdcs_section: "01-core-functionality"
//! tdcs_subsection: "binary"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Binary entrypoint for the T-DCS daemon."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use t_dcs_common::config::{AppConfig, LinkConfig, LinkProtocol};
use t_dcs_common::logging::init_tracing;
use t_dcs_common::time::{SystemClock, WallClock};
use t_dcs_core::channel::TcpChannelFactory;
use t_dcs_core::devices::DeviceRegistry;
use t_dcs_core::link::CommLink;
use t_dcs_core::poller::{
    AlarmPoller, DeviceRequest, LcsPoller, SamplePoller, SampleInterval, SignPoller,
    WarningSignPoller,
};
use t_dcs_dmslite::DmsLitePoller;
use t_dcs_metrics::{new_registry, spawn_http_server, CommMetrics, DaemonMetrics};
use t_dcs_mndot::frame::FrameFormat;
use t_dcs_mndot::MndotPoller;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Binned 5-minute data is collected every 300 seconds regardless of the
/// link's routine poll period.
const FIVE_MINUTE_SECS: u64 = 300;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "T-DCS daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the communication engine")]
    Run,
    #[command(about = "Validate the configuration and exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/example.toml"));
    candidates.push(PathBuf::from("/etc/t-dcs/config.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;

    if matches!(cli.command, Some(Commands::CheckConfig)) {
        println!("configuration ok: {}", loaded.source.display());
        return Ok(());
    }

    init_tracing("t-dcsd", &config.logging)?;
    info!(config = %loaded.source.display(), links = config.links.len(), "t-dcsd starting");

    let metrics_registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(metrics_registry.clone())?;
    daemon_metrics.inc_start();
    daemon_metrics.set_build_info(
        env!("CARGO_PKG_VERSION"),
        if cfg!(debug_assertions) { "debug" } else { "release" },
    );
    let comm_metrics = CommMetrics::new(metrics_registry.clone())?;
    let metrics_server = if config.metrics.enabled {
        Some(spawn_http_server(
            metrics_registry.clone(),
            config.metrics.listen,
        )?)
    } else {
        None
    };

    let registry = Arc::new(DeviceRegistry::from_config(&config));
    let clock: Arc<dyn WallClock> = Arc::new(SystemClock);
    let (shutdown_tx, _) = broadcast::channel(8);

    let mut links = Vec::new();
    let mut schedulers = Vec::new();
    for (link_id, link_cfg) in &config.links {
        let (link, scheduler) = spawn_link(
            link_id,
            link_cfg,
            &config,
            registry.clone(),
            clock.clone(),
            comm_metrics.clone(),
            &shutdown_tx,
        )?;
        links.push(link);
        schedulers.push(scheduler);
    }

    signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(());
    for scheduler in schedulers {
        if let Err(err) = scheduler.await {
            warn!(error = %err, "scheduler join error");
        }
    }
    for link in links {
        link.shutdown().await;
    }
    if let Some(server) = metrics_server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics server shutdown error");
        }
    }
    info!("t-dcsd stopped");
    Ok(())
}

/// Spawn the worker and routine-poll scheduler for one configured link.
fn spawn_link(
    link_id: &str,
    link_cfg: &LinkConfig,
    config: &AppConfig,
    registry: Arc<DeviceRegistry>,
    clock: Arc<dyn WallClock>,
    comm_metrics: CommMetrics,
    shutdown: &broadcast::Sender<()>,
) -> Result<(CommLink, JoinHandle<()>)> {
    let factory = Arc::new(TcpChannelFactory::new(
        link_cfg.uri.clone(),
        link_cfg.connect_timeout,
        link_cfg.read_timeout,
    ));
    let controllers: Vec<String> = link_cfg.controllers.keys().cloned().collect();
    let period = link_cfg.poll_period;

    match link_cfg.protocol {
        LinkProtocol::Mndot4 | LinkProtocol::Mndot5 => {
            let format = FrameFormat::for_protocol(link_cfg.protocol)
                .context("mndot link without a frame format")?;
            let download = t_dcs_mndot::poller::download_handler(
                format,
                registry.clone(),
                config.meter.clone(),
                clock.clone(),
            );
            let link = CommLink::spawn(
                link_id,
                factory,
                registry.clone(),
                Some(download),
                Some(comm_metrics),
                shutdown.subscribe(),
            );
            let poller = MndotPoller::new(
                link.handle(),
                format,
                registry.clone(),
                config.meter.clone(),
                clock,
            );
            let scheduler = tokio::spawn(run_mndot_schedule(
                poller,
                registry,
                controllers,
                period,
                shutdown.subscribe(),
            ));
            Ok((link, scheduler))
        }
        LinkProtocol::DmsLite => {
            let link = CommLink::spawn(
                link_id,
                factory,
                registry.clone(),
                None,
                Some(comm_metrics),
                shutdown.subscribe(),
            );
            let signs: Vec<String> = controllers
                .iter()
                .flat_map(|c| registry.signs_on(c))
                .map(|d| d.name().to_owned())
                .collect();
            let poller = DmsLitePoller::new(
                link.handle(),
                registry,
                config.dmslite.clone(),
                clock,
            );
            let scheduler = tokio::spawn(run_dmslite_schedule(
                poller,
                signs,
                period,
                shutdown.subscribe(),
            ));
            Ok((link, scheduler))
        }
    }
}

/// How many routine ticks make up a 5-minute collection cycle.
fn five_minute_every(period: Duration) -> u64 {
    (FIVE_MINUTE_SECS / period.as_secs().max(1)).max(1)
}

async fn run_mndot_schedule(
    poller: MndotPoller,
    registry: Arc<DeviceRegistry>,
    controllers: Vec<String>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    // Settings download first, matching field practice after a comm outage.
    for controller in &controllers {
        poller.send_settings(controller);
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let five_min = five_minute_every(period);
    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                tick += 1;
                for controller in &controllers {
                    if t_dcs_mndot::poller::has_pollable_devices(&registry, controller) {
                        poller.query_samples(controller, SampleInterval::ThirtySeconds);
                        poller.query_alarms(controller);
                        if tick % five_min == 0 {
                            poller.query_samples(controller, SampleInterval::FiveMinutes);
                        }
                    }
                    for array in registry.lcs_on(controller) {
                        poller.send_lcs_request(array.name(), DeviceRequest::QueryStatus);
                    }
                    for sign in registry.warning_signs_on(controller) {
                        poller.send_warning_request(sign.name(), DeviceRequest::QueryStatus);
                    }
                }
            }
        }
    }
}

async fn run_dmslite_schedule(
    poller: DmsLitePoller,
    signs: Vec<String>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    for sign in &signs {
        poller.send_sign_request(sign, DeviceRequest::QueryConfig);
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let five_min = five_minute_every(period);
    let mut tick: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                tick += 1;
                for sign in &signs {
                    poller.send_sign_request(sign, DeviceRequest::QueryMessage);
                    if tick % five_min == 0 {
                        poller.send_sign_request(sign, DeviceRequest::QueryStatus);
                    }
                }
            }
        }
    }
}
