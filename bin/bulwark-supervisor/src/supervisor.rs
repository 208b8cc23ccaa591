//! Child process supervision.

use std::{
    ffi::OsString,
    io,
    os::unix::process::CommandExt as _,
    path::PathBuf,
    process::{Command, Stdio},
};

use futures::future::select_all;
use nix::{
    errno::Errno,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use snafu::{ResultExt as _, Snafu};
use tokio::{
    signal::unix::{signal, SignalKind},
    time::MissedTickBehavior,
};
use tracing::{error, info, warn};

use crate::{config::SupervisorConfiguration, probe::ProcessProbe};

/// A supervisor error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum SupervisorError {
    /// The child process could not be started.
    #[snafu(display("Failed to start process {}: {}", exe.display(), source))]
    Spawn {
        /// Executable.
        exe: PathBuf,

        /// Error source.
        source: io::Error,
    },

    /// A signal handler could not be installed.
    #[snafu(display("Failed to install signal handler: {}", source))]
    SignalHandler {
        /// Error source.
        source: io::Error,
    },
}

/// Why supervision ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SupervisionOutcome {
    /// The child's process group emptied and stayed empty past the grace checks.
    ChildDied,

    /// The supervisor received a signal and forwarded `SIGTERM` to the child's process group.
    Signalled(Signal),
}

/// Result of one liveness check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Liveness {
    /// The group has members.
    Alive,

    /// The group is empty, but grace checks remain.
    Grace {
        /// Grace checks left.
        remaining: i64,
    },

    /// The group is empty, and no grace checks remain.
    Dead,
}

/// Tolerates a child that has not yet shown up in its process group.
///
/// Every empty check uses up one grace check. Once the group has been seen alive, tolerance drops to zero, so the
/// next empty check is fatal.
#[derive(Clone, Copy, Debug)]
pub struct GraceCounter {
    remaining: i64,
}

impl GraceCounter {
    /// Creates a new `GraceCounter` with the given number of grace checks.
    pub fn new(grace_checks: u32) -> Self {
        Self {
            remaining: i64::from(grace_checks),
        }
    }

    /// Records the result of one check.
    pub fn observe(&mut self, group_alive: bool) -> Liveness {
        if group_alive {
            self.remaining = 0;
            return Liveness::Alive;
        }

        self.remaining -= 1;
        if self.remaining <= 0 {
            Liveness::Dead
        } else {
            Liveness::Grace {
                remaining: self.remaining,
            }
        }
    }
}

/// Starts a child process as its own process group leader, and watches the group until it is gone.
pub struct Supervisor<P> {
    exe: PathBuf,
    args: Vec<OsString>,
    config: SupervisorConfiguration,
    probe: P,
}

impl<P> Supervisor<P>
where
    P: ProcessProbe,
{
    /// Creates a new `Supervisor`.
    pub fn new(exe: PathBuf, args: Vec<OsString>, config: SupervisorConfiguration, probe: P) -> Self {
        Self {
            exe,
            args,
            config,
            probe,
        }
    }

    /// Starts the child and supervises it.
    ///
    /// Returns once the child's process group is gone, or a signal has been forwarded to it. A dead child is never
    /// restarted.
    ///
    /// # Errors
    ///
    /// If the child cannot be started, or signal handlers cannot be installed, an error will be returned.
    pub async fn run(self) -> Result<SupervisionOutcome, SupervisorError> {
        let SupervisorSignals {
            mut child,
            mut terminating,
        } = SupervisorSignals::install()?;
        let pgid = self.start_child()?;

        let mut grace = GraceCounter::new(self.config.nelly_startup_grace_checks);
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.check(pgid, &mut grace) == Liveness::Dead {
                        return Ok(SupervisionOutcome::ChildDied);
                    }
                }
                _ = child.recv() => {
                    if self.check(pgid, &mut grace) == Liveness::Dead {
                        return Ok(SupervisionOutcome::ChildDied);
                    }
                }
                received = any_signal(&mut terminating) => {
                    error!(signal = %received, pgid, "Caught signal. Killing process group.");
                    forward_termination(pgid);
                    return Ok(SupervisionOutcome::Signalled(received));
                }
            }
        }
    }

    fn start_child(&self) -> Result<i32, SupervisorError> {
        let child = Command::new(&self.exe)
            .args(&self.args)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .context(Spawn { exe: &self.exe })?;

        // As group leader, the child's process ID is its process group ID.
        let pgid = child.id() as i32;
        info!(exe = %self.exe.display(), pid = pgid, "Started executable.");
        Ok(pgid)
    }

    fn check(&self, pgid: i32, grace: &mut GraceCounter) -> Liveness {
        reap_zombies(pgid);

        let liveness = grace.observe(self.probe.group_alive(pgid));
        match liveness {
            Liveness::Alive => {}
            Liveness::Grace { remaining } => warn!(pgid, remaining, "Process group empty. Grace checks left."),
            Liveness::Dead => error!(pgid, "Process group empty. Exiting."),
        }
        liveness
    }
}

/// Reaps every member of the process group that has already exited, without blocking.
fn reap_zombies(pgid: i32) {
    loop {
        match waitpid(Pid::from_raw(-pgid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, status)) => warn!(pid = pid.as_raw(), status, "Reaped exited process."),
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                warn!(pid = pid.as_raw(), signal = %signal, "Reaped killed process.")
            }
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to reap exited processes.");
                break;
            }
        }
    }
}

fn forward_termination(pgid: i32) {
    if let Err(e) = kill(Pid::from_raw(-pgid), Signal::SIGTERM) {
        error!(pgid, error = %e, "Failed to signal process group.");
    }
}

struct SupervisorSignals {
    child: tokio::signal::unix::Signal,
    terminating: Vec<(Signal, tokio::signal::unix::Signal)>,
}

impl SupervisorSignals {
    fn install() -> Result<Self, SupervisorError> {
        let child = signal(SignalKind::child()).context(SignalHandler)?;

        let mut terminating = Vec::new();
        for received in [
            Signal::SIGTERM,
            Signal::SIGINT,
            Signal::SIGHUP,
            Signal::SIGQUIT,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
        ] {
            let stream = signal(SignalKind::from_raw(received as i32)).context(SignalHandler)?;
            terminating.push((received, stream));
        }

        Ok(Self { child, terminating })
    }
}

/// Waits for any of the given signals.
async fn any_signal(streams: &mut [(Signal, tokio::signal::unix::Signal)]) -> Signal {
    let pending = streams.iter_mut().map(|(received, stream)| {
        let received = *received;
        Box::pin(async move {
            stream.recv().await;
            received
        })
    });
    let (received, _, _) = select_all(pending).await;
    received
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn grace_checks_run_out() {
        let mut grace = GraceCounter::new(3);
        assert_eq!(grace.observe(false), Liveness::Grace { remaining: 2 });
        assert_eq!(grace.observe(false), Liveness::Grace { remaining: 1 });
        assert_eq!(grace.observe(false), Liveness::Dead);
    }

    #[test]
    fn alive_check_drops_tolerance_to_zero() {
        let mut grace = GraceCounter::new(3);
        assert_eq!(grace.observe(false), Liveness::Grace { remaining: 2 });
        assert_eq!(grace.observe(true), Liveness::Alive);
        assert_eq!(grace.observe(true), Liveness::Alive);

        // Tolerance does not accumulate once the child has been seen.
        assert_eq!(grace.observe(false), Liveness::Dead);
    }

    #[test]
    fn zero_grace_checks_fail_on_first_empty_check() {
        let mut grace = GraceCounter::new(0);
        assert_eq!(grace.observe(false), Liveness::Dead);
    }

    #[tokio::test]
    async fn exited_child_is_detected() {
        let config = SupervisorConfiguration {
            nelly_check_secs: 0.05,
            nelly_startup_grace_checks: 2,
        };
        let supervisor = Supervisor::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".into(), "sleep 0.2".into()],
            config,
            crate::probe::SignalProbe,
        );

        let outcome = tokio::time::timeout(Duration::from_secs(10), supervisor.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SupervisionOutcome::ChildDied);
    }

    #[tokio::test]
    async fn missing_executable_fails_to_start() {
        let supervisor = Supervisor::new(
            PathBuf::from("/nonexistent/widgets"),
            Vec::new(),
            SupervisorConfiguration::default(),
            crate::probe::SignalProbe,
        );

        assert!(matches!(supervisor.run().await, Err(SupervisorError::Spawn { .. })));
    }
}
