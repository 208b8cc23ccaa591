//! Demo service.
//!
//! A small HTTP service that runs on the bulwark runtime: every request is tracked, failures are recovered into error
//! responses, the resource watchdog is running, and `SIGUSR2` hands the listener over to a fresh copy of this binary.

#![deny(warnings)]
#![deny(missing_docs)]

use std::path::{Path, PathBuf};

use bulwark_app::prelude::*;
use bulwark_config::{ConfigurationLoader, GenericConfiguration};
use bulwark_error::GenericError;
use bulwark_runtime::{config::ServiceConfiguration, server::ServiceRunner};
use clap::Parser;
use tracing::{error, info};

mod routes;

#[global_allocator]
static ALLOC: process_stats::CountingAllocator<std::alloc::System> =
    process_stats::CountingAllocator::new(std::alloc::System);

/// Demo service for the bulwark runtime.
#[derive(Parser)]
#[command(about)]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(long, short = 'c', default_value = "/etc/bulwark/demo-service.yaml")]
    config: PathBuf,
}

fn load_configuration(path: &Path) -> Result<GenericConfiguration, GenericError> {
    Ok(ConfigurationLoader::default()
        .try_from_yaml(path)
        .from_environment("BULWARK")?
        .into_generic())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let configuration = load_configuration(&cli.config)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {:?}", e)));
    let logging_config = LoggingConfiguration::try_from_config(&configuration)
        .unwrap_or_else(|e| fatal_and_exit(format!("invalid logging configuration: {:?}", e)));
    let log_guard = initialize_logging(&logging_config)
        .unwrap_or_else(|e| fatal_and_exit(format!("failed to initialize logging: {:?}", e)));

    let service_config = ServiceConfiguration::try_from_config(&configuration)
        .unwrap_or_else(|e| fatal_and_exit(format!("invalid service configuration: {:?}", e)));
    if let Err(e) = initialize_metrics(service_config.metrics_prefix()) {
        fatal_and_exit(format!("failed to initialize metrics: {:?}", e));
    }

    info!(project = %service_config.project, app = %service_config.app, pid = std::process::id(), "Demo service starting.");

    let exit_code = match ServiceRunner::new(configuration).with_routes(routes::routes()).run().await {
        Ok(outcome) => {
            info!(?outcome, "Demo service stopped.");
            0
        }
        Err(e) => {
            error!("{:?}", e);
            1
        }
    };

    // Abandoned connections may still be running on the runtime, so exit without waiting for them.
    drop(log_guard);
    std::process::exit(exit_code);
}
