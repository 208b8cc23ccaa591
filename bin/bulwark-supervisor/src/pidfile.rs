//! Pidfile-based mutual exclusion between supervisors.
//!
//! The pidfile holds the supervisor's process ID followed by a newline. Checking and claiming it are separate steps,
//! so two supervisors starting at the same instant can both succeed.

use std::{
    io,
    path::{Path, PathBuf},
};

use snafu::{ResultExt as _, Snafu};
use tracing::{error, info, warn};

use crate::probe::ProcessProbe;

/// A pidfile error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum PidFileError {
    /// The runtime state directory does not exist, or cannot be inspected.
    #[snafu(display("Can't stat pid dir {}: {}", dir.display(), source))]
    MissingRunDir {
        /// Runtime state directory.
        dir: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// Another live process owns the pidfile.
    #[snafu(display("Pid {} is running and owns {}.", pid, path.display()))]
    AlreadyRunning {
        /// Process ID recorded in the pidfile.
        pid: i32,

        /// Path to the pidfile.
        path: PathBuf,
    },

    /// The pidfile could not be written.
    #[snafu(display("Can't write pid file {}: {}", path.display(), source))]
    Write {
        /// Path to the pidfile.
        path: PathBuf,

        /// Error source.
        source: io::Error,
    },
}

/// A pidfile claimed by this process.
///
/// The file is removed when this is dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Path of the pidfile for `service` within `run_dir`.
    pub fn path_for(run_dir: &Path, service: &str) -> PathBuf {
        run_dir.join(format!("{}.pid", service))
    }

    /// Claims the pidfile for `service` within `run_dir`.
    ///
    /// A pidfile naming a process that is no longer alive is reclaimed.
    ///
    /// # Errors
    ///
    /// If `run_dir` does not exist, the pidfile names a live process, or the pidfile cannot be written, an error will be
    /// returned. A pidfile owned by a live process is left untouched.
    pub fn claim<P>(run_dir: &Path, service: &str, probe: &P) -> Result<Self, PidFileError>
    where
        P: ProcessProbe,
    {
        std::fs::metadata(run_dir).context(MissingRunDir { dir: run_dir })?;

        let path = Self::path_for(run_dir, service);
        if let Some(pid) = read_pid(&path) {
            warn!(pid, path = %path.display(), "Pid file exists.");
            if probe.process_alive(pid) {
                return AlreadyRunning { pid, path }.fail();
            }
            warn!(pid, "Recorded process is not running. Claiming pid file.");
        }

        let pid = std::process::id();
        std::fs::write(&path, format!("{}\n", pid)).context(Write { path: &path })?;
        info!(pid, path = %path.display(), "Claimed pid file.");

        Ok(Self { path })
    }

    /// Path to the pidfile.
    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!(path = %self.path.display(), error = %e, "Failed to remove pid file.");
        }
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                info!(path = %path.display(), error = %e, "Failed to read pid file.");
            }
            return None;
        }
    };

    contents.trim().parse().ok().filter(|pid| *pid > 0)
}
