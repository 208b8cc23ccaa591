//! External process supervisor.
//!
//! Starts a service as the leader of its own process group, then watches the group: once it is empty for longer than
//! the startup grace allows, the supervisor exits so that whatever runs it can react. A pidfile keeps two supervisors
//! from managing the same service.

#![deny(warnings)]
#![deny(missing_docs)]
#![cfg_attr(not(unix), allow(dead_code))]

use clap::Parser as _;

mod config;
use self::config::Cli;

#[cfg(unix)]
mod pidfile;

#[cfg(unix)]
mod probe;

#[cfg(unix)]
mod supervisor;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    #[cfg(unix)]
    std::process::exit(unix::run(cli).await);

    #[cfg(not(unix))]
    {
        let _ = cli;
        bulwark_app::logging::fatal_and_exit("Process supervision is only supported on Unix platforms.".to_string());
    }
}

#[cfg(unix)]
mod unix {
    use bulwark_app::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
    use bulwark_config::{ConfigurationLoader, GenericConfiguration};
    use bulwark_error::GenericError;
    use tracing::{error, info};

    use crate::{
        config::{Cli, SupervisorConfiguration},
        pidfile::PidFile,
        probe::SignalProbe,
        supervisor::{SupervisionOutcome, Supervisor},
    };

    fn load_configuration(cli: &Cli) -> Result<GenericConfiguration, GenericError> {
        let mut loader = ConfigurationLoader::default();
        if let Some(path) = cli.config.as_ref() {
            loader = loader.from_yaml(path)?;
        }
        Ok(loader.from_environment("BULWARK")?.into_generic())
    }

    /// Runs the supervisor, returning the process exit code.
    pub async fn run(cli: Cli) -> i32 {
        let configuration = load_configuration(&cli)
            .unwrap_or_else(|e| fatal_and_exit(format!("failed to load configuration: {:?}", e)));
        let logging_config = LoggingConfiguration::try_from_config(&configuration)
            .unwrap_or_else(|e| fatal_and_exit(format!("invalid logging configuration: {:?}", e)));
        let _guard = initialize_logging(&logging_config)
            .unwrap_or_else(|e| fatal_and_exit(format!("failed to initialize logging: {:?}", e)));

        let config = match SupervisorConfiguration::try_from_config(&configuration) {
            Ok(config) => config,
            Err(e) => {
                error!("Invalid supervisor configuration: {:?}", e);
                return 1;
            }
        };
        info!(project = %cli.project, service = %cli.service, exe = %cli.exe.display(), "Supervisor initialized.");

        let pidfile = match PidFile::claim(&cli.run_dir(), &cli.service, &SignalProbe) {
            Ok(pidfile) => pidfile,
            Err(e) => {
                error!(error = %e, "Not ok to start. Exiting.");
                return 1;
            }
        };

        let supervisor = Supervisor::new(cli.exe, cli.args, config, SignalProbe);
        let exit_code = match supervisor.run().await {
            Ok(SupervisionOutcome::Signalled(signal)) => {
                error!(%signal, "Exiting on signal.");
                0
            }
            Ok(SupervisionOutcome::ChildDied) => {
                error!("Descendants are dead. Exiting.");
                1
            }
            Err(e) => {
                error!(error = %e, "Supervision failed.");
                1
            }
        };

        drop(pidfile);
        exit_code
    }
}
