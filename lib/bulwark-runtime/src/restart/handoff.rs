//! Listening socket handoff between an outgoing process and its replacement.
//!
//! The outgoing process spawns its replacement with the listening socket as file descriptor 3, and marks the
//! environment with [`LISTENER_FD_ENV`] and [`PARENT_PID_ENV`]. The replacement adopts the socket instead of binding a
//! new one, and once it is serving, tells the outgoing process with `SIGUSR1` so that it can start draining.
//!
//! On platforms without file descriptor inheritance, a fresh listener is bound every time.

use std::{ffi::OsString, io, net::SocketAddr, path::PathBuf};

use snafu::{ResultExt as _, Snafu};
use tokio::net::TcpListener;
use tracing::info;

/// Environment variable naming the inherited listener's file descriptor.
pub const LISTENER_FD_ENV: &str = "BULWARK_LISTENER_FD";

/// Environment variable naming the process that handed over the listener.
pub const PARENT_PID_ENV: &str = "BULWARK_PARENT_PID";

#[cfg(unix)]
const INHERITED_FD: std::os::fd::RawFd = 3;

/// A listener handoff error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub(crate)))]
pub enum ListenerError {
    /// Binding a fresh listener failed.
    #[snafu(display("Failed to bind listener to {}: {}", addr, source))]
    Bind {
        /// Address to bind to.
        addr: SocketAddr,

        /// Error source.
        source: io::Error,
    },

    /// The inherited listener descriptor could not be parsed.
    #[snafu(display("Inherited listener descriptor '{}' is not valid.", value))]
    InvalidDescriptor {
        /// Value of the environment variable.
        value: String,
    },

    /// The inherited listener could not be adopted.
    #[snafu(display("Failed to adopt inherited listener: {}", source))]
    Adopt {
        /// Error source.
        source: io::Error,
    },

    /// The replacement process could not be spawned.
    #[snafu(display("Failed to spawn replacement process: {}", source))]
    Spawn {
        /// Error source.
        source: io::Error,
    },

    /// The outgoing process could not be told that the handoff completed.
    #[snafu(display("Failed to notify process {} of handoff: {}", pid, source))]
    NotifyParent {
        /// Process ID of the outgoing process.
        pid: i32,

        /// Error source.
        source: io::Error,
    },

    /// A signal handler could not be installed.
    #[snafu(display("Failed to install signal handler: {}", source))]
    Signal {
        /// Error source.
        source: io::Error,
    },
}

/// The process that handed over its listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParentProcess {
    pid: i32,
}

impl ParentProcess {
    /// Process ID.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Tells the outgoing process that this process is now serving on the inherited listener.
    ///
    /// # Errors
    ///
    /// If the signal cannot be delivered, an error will be returned.
    pub fn notify_handoff(&self) -> Result<(), ListenerError> {
        #[cfg(unix)]
        {
            use nix::{
                sys::signal::{kill, Signal},
                unistd::Pid,
            };

            kill(Pid::from_raw(self.pid), Signal::SIGUSR1)
                .map_err(io::Error::from)
                .context(NotifyParent { pid: self.pid })?;
            info!(parent_pid = self.pid, "Notified outgoing process of listener handoff.");
        }
        Ok(())
    }
}

/// A listener, either freshly bound or inherited from an outgoing process.
pub struct AcquiredListener {
    /// The listener.
    pub listener: TcpListener,

    /// The outgoing process, if the listener was inherited.
    pub parent: Option<ParentProcess>,
}

/// Handoff markers left in the environment by an outgoing process.
#[derive(Clone, Debug, Eq, PartialEq)]
struct HandoffMarkers {
    fd: String,
    parent: Option<ParentProcess>,
}

impl HandoffMarkers {
    /// Reads the markers, leaving the environment untouched.
    ///
    /// A replacement spawned by this process gets its own markers, so stale ones are never passed on.
    fn from_env() -> Option<Self> {
        let fd = std::env::var_os(LISTENER_FD_ENV)?.to_string_lossy().into_owned();
        let parent = std::env::var(PARENT_PID_ENV)
            .ok()
            .and_then(|pid| pid.trim().parse().ok())
            .map(|pid| ParentProcess { pid });
        Some(Self { fd, parent })
    }
}

/// Acquires the listener to serve on.
///
/// If this process was spawned as a replacement, the inherited listener is adopted. Otherwise a fresh listener is
/// bound to `addr`. Must be called at most once per process, from within a Tokio runtime.
///
/// # Errors
///
/// If the inherited listener cannot be adopted, or a fresh one cannot be bound, an error will be returned.
pub async fn acquire_listener(addr: SocketAddr) -> Result<AcquiredListener, ListenerError> {
    acquire(HandoffMarkers::from_env(), addr).await
}

#[cfg_attr(not(unix), allow(unused_variables))]
async fn acquire(markers: Option<HandoffMarkers>, addr: SocketAddr) -> Result<AcquiredListener, ListenerError> {
    #[cfg(unix)]
    {
        if let Some(markers) = markers {
            let fd = parse_descriptor(&markers.fd)?;
            let listener = adopt(fd)?;
            info!(fd, parent_pid = ?markers.parent.map(|p| p.pid), "Adopted inherited listener.");
            return Ok(AcquiredListener {
                listener,
                parent: markers.parent,
            });
        }
    }

    let listener = TcpListener::bind(addr).await.context(Bind { addr })?;
    info!(%addr, "Bound fresh listener.");
    Ok(AcquiredListener { listener, parent: None })
}

#[cfg(unix)]
fn parse_descriptor(value: &str) -> Result<std::os::fd::RawFd, ListenerError> {
    match value.trim().parse() {
        Ok(fd) if fd >= 0 => Ok(fd),
        _ => InvalidDescriptor { value }.fail(),
    }
}

#[cfg(unix)]
fn adopt(fd: std::os::fd::RawFd) -> Result<TcpListener, ListenerError> {
    use std::os::fd::FromRawFd as _;

    // SAFETY: the descriptor was handed to us by the outgoing process, and nothing else in this process owns it.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true).context(Adopt)?;
    TcpListener::from_std(listener).context(Adopt)
}

/// The command that starts a replacement process.
#[derive(Clone, Debug)]
pub struct ReplacementCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ReplacementCommand {
    /// Creates a new `ReplacementCommand`.
    pub fn new<I, A>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The command that started this process: the same executable, with the same arguments.
    ///
    /// # Errors
    ///
    /// If the path to the current executable cannot be determined, an error will be returned.
    pub fn current_process() -> Result<Self, ListenerError> {
        let program = std::env::current_exe().context(Spawn)?;
        Ok(Self::new(program, std::env::args_os().skip(1)))
    }

    /// Spawns the replacement process, passing it the given listener.
    ///
    /// # Errors
    ///
    /// If the process cannot be spawned, an error will be returned.
    #[cfg(unix)]
    pub fn spawn<L>(&self, listener: &L) -> Result<std::process::Child, ListenerError>
    where
        L: std::os::fd::AsRawFd,
    {
        use std::os::unix::process::CommandExt as _;

        let fd = listener.as_raw_fd();
        let mut command = std::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env(LISTENER_FD_ENV, INHERITED_FD.to_string())
            .env(PARENT_PID_ENV, std::process::id().to_string());

        // SAFETY: only async-signal-safe functions are called between fork and exec.
        unsafe {
            command.pre_exec(move || {
                if fd == INHERITED_FD {
                    // Already in place, but still marked close-on-exec.
                    if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                } else if libc::dup2(fd, INHERITED_FD) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().context(Spawn)?;
        info!(pid = child.id(), program = %self.program.display(), "Spawned replacement process.");
        Ok(child)
    }
}
