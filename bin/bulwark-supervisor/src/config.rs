use std::{ffi::OsString, path::PathBuf, time::Duration};

use bulwark_config::GenericConfiguration;
use bulwark_error::GenericError;
use clap::Parser;
use serde::Deserialize;

/// Keeps one service process alive, and refuses to run alongside another supervisor for the same service.
#[derive(Debug, Parser)]
#[command(about)]
pub struct Cli {
    /// Executable to run.
    #[arg(long)]
    pub exe: PathBuf,

    /// Name of the service, used to name the pidfile.
    #[arg(long)]
    pub service: String,

    /// Name of the project the service belongs to.
    #[arg(long)]
    pub project: String,

    /// Directory holding the pidfile.
    ///
    /// Defaults to `/var/run/<project>`.
    #[arg(long)]
    pub run_dir: Option<PathBuf>,

    /// Path to a YAML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Arguments passed to the executable.
    #[arg(last = true)]
    pub args: Vec<OsString>,
}

impl Cli {
    /// Directory holding the pidfile.
    pub fn run_dir(&self) -> PathBuf {
        self.run_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("/var/run").join(&self.project))
    }
}

const fn default_nelly_check_secs() -> f64 {
    1.0
}

const fn default_nelly_startup_grace_checks() -> u32 {
    5
}

/// Supervision options.
#[derive(Clone, Debug, Deserialize)]
pub struct SupervisorConfiguration {
    /// How often to check on the child's process group, in seconds.
    ///
    /// Defaults to 1 second.
    #[serde(default = "default_nelly_check_secs")]
    pub nelly_check_secs: f64,

    /// Number of checks that may find the child's process group empty before the child has been seen alive once.
    ///
    /// Defaults to 5.
    #[serde(default = "default_nelly_startup_grace_checks")]
    pub nelly_startup_grace_checks: u32,
}

impl Default for SupervisorConfiguration {
    fn default() -> Self {
        Self {
            nelly_check_secs: default_nelly_check_secs(),
            nelly_startup_grace_checks: default_nelly_startup_grace_checks(),
        }
    }
}

impl SupervisorConfiguration {
    /// Creates a new `SupervisorConfiguration` from the given configuration.
    pub fn try_from_config(config: &GenericConfiguration) -> Result<Self, GenericError> {
        Ok(config.as_typed::<Self>()?)
    }

    /// Interval between checks. Never shorter than one millisecond.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.nelly_check_secs.max(0.001))
    }
}

#[cfg(test)]
mod tests {
    use bulwark_config::ConfigurationLoader;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_flags_and_trailing_args() {
        let cli = Cli::parse_from([
            "bulwark-supervisor",
            "--exe",
            "/usr/bin/widgets",
            "--service",
            "widgets",
            "--project",
            "acme",
            "--",
            "--port",
            "9000",
        ]);

        assert_eq!(cli.exe, PathBuf::from("/usr/bin/widgets"));
        assert_eq!(cli.run_dir(), PathBuf::from("/var/run/acme"));
        assert_eq!(cli.args, vec![OsString::from("--port"), OsString::from("9000")]);
    }

    #[test]
    fn service_and_project_are_required() {
        assert!(Cli::try_parse_from(["bulwark-supervisor", "--exe", "/bin/true", "--project", "acme"]).is_err());
        assert!(Cli::try_parse_from(["bulwark-supervisor", "--exe", "/bin/true", "--service", "widgets"]).is_err());
    }

    #[test]
    fn configuration_defaults_and_overrides() {
        let config = SupervisorConfiguration::try_from_config(&GenericConfiguration::empty()).unwrap();
        assert_eq!(config.check_interval(), Duration::from_secs(1));
        assert_eq!(config.nelly_startup_grace_checks, 5);

        let config = ConfigurationLoader::default()
            .with_values(json!({ "nelly_check_secs": 0.25, "nelly_startup_grace_checks": 3 }))
            .into_generic();
        let config = SupervisorConfiguration::try_from_config(&config).unwrap();
        assert_eq!(config.check_interval(), Duration::from_millis(250));
        assert_eq!(config.nelly_startup_grace_checks, 3);
    }
}
