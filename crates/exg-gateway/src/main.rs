//! Gateway entry point.
//!
//! Runs against the in-process paper broker; live adapters are wired in
//! by deployment-specific builds.

use exg_broker::{Broker, PaperBroker};
use exg_core::Profile;
use exg_gateway::{AppConfig, Gateway};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = exg_telemetry::init_logging(&config.telemetry.log_filter) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(symbols = config.symbols.len(), "starting signal execution gateway");

    let broker = PaperBroker::shared();
    let gateway = match Gateway::new(config, broker as Arc<dyn Broker>) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(?e, "failed to assemble gateway");
            std::process::exit(1);
        }
    };

    // Paper-mode bootstrap profile; production profiles arrive over the
    // admin surface.
    let profile = Profile::new("paper-default", "paper", "paper");
    if let Err(e) = gateway.add_profile(profile, Decimal::from(10_000)).await {
        error!(?e, "failed to register bootstrap profile");
        std::process::exit(1);
    }

    info!("gateway running, ctrl-c to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(?e, "signal handler failed");
    }

    gateway.shutdown().await;
    info!("gateway stopped");
}
