//! Process resource sampling.
//!
//! This crate answers the handful of questions a resource watchdog needs answered about the current process: how much
//! resident memory it holds, how many heap bytes are currently live, how many file descriptors are open, and how many
//! OS threads exist.
//!
//! ## Linux
//!
//! Everything is read from [procfs](https://docs.kernel.org/filesystems/proc.html):
//!
//! - resident set size from `/proc/self/statm`
//! - open file descriptors by counting the entries of `/proc/self/fd`
//! - thread count from the `Threads:` line of `/proc/self/status`
//!
//! ## Other platforms
//!
//! No support yet: every OS-level counter is reported as unavailable.
//!
//! ## Live heap bytes
//!
//! Live heap bytes are only known when the binary installs [`CountingAllocator`] as its global allocator. Without it,
//! [`Sampler::live_heap_bytes`] reports `None`.
#![deny(warnings)]
#![deny(missing_docs)]

use serde::Serialize;

mod allocator;
pub use self::allocator::{AllocatorStats, CountingAllocator};

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
use self::linux as platform;

#[cfg(not(target_os = "linux"))]
mod platform {
    pub fn resident_set_size() -> Option<u64> {
        None
    }

    pub fn open_fds() -> Option<u64> {
        None
    }

    pub fn thread_count() -> Option<u64> {
        None
    }
}

/// A point-in-time sample of process resource usage.
///
/// Counters that could not be determined on this platform are `None`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ProcessSample {
    /// Resident set size, in bytes.
    pub resident_bytes: Option<u64>,

    /// Heap bytes currently allocated and not yet freed.
    pub live_heap_bytes: Option<u64>,

    /// Number of open file descriptors.
    pub open_fds: Option<u64>,

    /// Number of OS threads.
    pub threads: Option<u64>,
}

/// Samples resource usage of the current process.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sampler;

impl Sampler {
    /// Gets the resident set size of this process, in bytes.
    pub fn resident_set_size(&self) -> Option<u64> {
        platform::resident_set_size()
    }

    /// Gets the number of heap bytes currently live.
    ///
    /// Returns `None` unless [`CountingAllocator`] is the global allocator.
    pub fn live_heap_bytes(&self) -> Option<u64> {
        let stats = AllocatorStats::global();
        stats.is_installed().then(|| stats.live_bytes())
    }

    /// Gets the number of open file descriptors.
    pub fn open_fds(&self) -> Option<u64> {
        platform::open_fds()
    }

    /// Gets the number of OS threads in this process.
    pub fn thread_count(&self) -> Option<u64> {
        platform::thread_count()
    }

    /// Takes a sample of every counter.
    pub fn sample(&self) -> ProcessSample {
        ProcessSample {
            resident_bytes: self.resident_set_size(),
            live_heap_bytes: self.live_heap_bytes(),
            open_fds: self.open_fds(),
            threads: self.thread_count(),
        }
    }
}
