extern crate tokio;

use clap::Parser;
use env_logger::Env;
use log::{info, warn};
use miette::{IntoDiagnostic, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

use mayara_client::client::ControlClient;
use mayara_client::config::Persistence;
use mayara_client::manager::{ManagerConfig, RadarManager};
use mayara_client::radar::legend::ColorLookup;
use mayara_client::stats::Reporter;
use mayara_client::{Cli, PACKAGE, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let log_level = args.verbose.log_level_filter();
    env_logger::Builder::from_env(Env::default())
        .filter_level(log_level)
        .filter_module("tungstenite::protocol", log::LevelFilter::Info)
        .filter_module("reqwest", log::LevelFilter::Info)
        .filter_module("hyper_util", log::LevelFilter::Info)
        .init();

    info!("{} {} loglevel {}", PACKAGE, VERSION, log_level);

    let mut persistence = if args.no_persist {
        warn!("Settings are not read or written");
        Persistence::in_memory()
    } else {
        Persistence::new()
    };
    persistence.apply_args(&args);

    let server = persistence.config.server.clone();
    let display = persistence.config.display.clone();

    let control = ControlClient::new(&server.host, server.port).into_diagnostic()?;
    let config = ManagerConfig::new(
        server.discovery_interval,
        server.reconnect_interval,
        args.spoke_backoff,
        args.poll_interval,
    );
    info!(
        "Server {}:{}, discovery every {:?}, reconnect every {:?}",
        server.host, server.port, config.discovery_interval, config.reconnect_interval
    );

    let manager = RadarManager::new(Arc::new(control), config).with_persistence(persistence);
    let reporter = Reporter::new(
        manager.sessions(),
        ColorLookup::build(display.scheme, display.thresholds),
        Duration::from_secs(args.stats_interval),
    );
    let report = args.stats_interval > 0;

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("Radar manager", |a| manager.run(a)));
        if report {
            s.start(SubsystemBuilder::new("Statistics", |a| reporter.run(a)));
        }
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_millis(5000))
    .await
    .map_err(Into::into)
}
