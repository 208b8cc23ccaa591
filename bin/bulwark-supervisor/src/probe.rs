use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use tracing::debug;

/// Liveness checks against processes and process groups.
pub trait ProcessProbe {
    /// Returns `true` if a process with the given ID exists.
    fn process_alive(&self, pid: i32) -> bool;

    /// Returns `true` if the given process group has at least one member.
    fn group_alive(&self, pgid: i32) -> bool;
}

/// Probes with signal 0, which checks for existence and permission without delivering anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalProbe;

impl SignalProbe {
    fn probe(target: Pid) -> bool {
        match kill(target, None) {
            Ok(()) => true,
            // Someone else's process, but it exists.
            Err(Errno::EPERM) => true,
            Err(e) => {
                debug!(target = target.as_raw(), error = %e, "Liveness probe failed.");
                false
            }
        }
    }
}

impl ProcessProbe for SignalProbe {
    fn process_alive(&self, pid: i32) -> bool {
        pid > 0 && Self::probe(Pid::from_raw(pid))
    }

    fn group_alive(&self, pgid: i32) -> bool {
        pgid > 0 && Self::probe(Pid::from_raw(-pgid))
    }
}
