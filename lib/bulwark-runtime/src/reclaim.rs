//! Forced memory reclaim.
//!
//! A reclaim cycle asks the allocator to hand unused memory back to the operating system. Cycles are run on the
//! blocking thread pool, and how long each one took is kept so that the watchdog can report a min/median/max summary.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::warn;

const RECENT_PAUSES_LEN: usize = 256;

/// A way of returning unused heap memory to the operating system.
pub trait MemoryReclaimer: Send + Sync {
    /// Runs one reclaim cycle. May block.
    fn reclaim(&self);

    /// Adjusts how aggressively memory is reclaimed, as a percentage.
    ///
    /// Returns the previous setting, or `None` if this reclaimer has no such knob.
    fn set_tuning_percentage(&self, _percent: u32) -> Option<u32> {
        None
    }
}

/// Reclaims memory from the system allocator.
///
/// On Linux with glibc, this trims free memory at the top of the heap and in every arena with `malloc_trim`. Elsewhere
/// it does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemReclaimer;

impl MemoryReclaimer for SystemReclaimer {
    fn reclaim(&self) {
        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        {
            // SAFETY: `malloc_trim` has no preconditions.
            let released = unsafe { libc::malloc_trim(0) };
            tracing::debug!(released = released == 1, "Trimmed system allocator.");
        }
    }
}

/// Summary of recent reclaim pauses.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PauseSummary {
    /// Shortest recent pause.
    pub min: Duration,

    /// Median recent pause.
    pub median: Duration,

    /// Longest recent pause.
    pub max: Duration,

    /// Number of reclaim cycles ever run.
    pub cycles: u64,
}

impl fmt::Display for PauseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}/{:?}", self.min, self.median, self.max)
    }
}

#[derive(Default)]
struct PauseHistory {
    recent: VecDeque<Duration>,
    cycles: u64,
}

/// Runs reclaim cycles and records how long they took.
#[derive(Clone)]
pub struct MemoryReclaim {
    reclaimer: Arc<dyn MemoryReclaimer>,
    history: Arc<Mutex<PauseHistory>>,
}

impl MemoryReclaim {
    /// Creates a new `MemoryReclaim` around the given reclaimer.
    pub fn new<R>(reclaimer: R) -> Self
    where
        R: MemoryReclaimer + 'static,
    {
        Self {
            reclaimer: Arc::new(reclaimer),
            history: Arc::new(Mutex::new(PauseHistory::default())),
        }
    }

    /// Runs one reclaim cycle on the calling thread, returning how long it took.
    pub fn run_blocking(&self) -> Duration {
        let start = Instant::now();
        self.reclaimer.reclaim();
        let pause = start.elapsed();
        self.record(pause);
        pause
    }

    /// Runs one reclaim cycle on the blocking thread pool, returning how long it took.
    pub async fn run(&self) -> Duration {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || this.run_blocking()).await {
            Ok(pause) => pause,
            Err(e) => {
                warn!(error = %e, "Memory reclaim cycle did not complete.");
                Duration::ZERO
            }
        }
    }

    /// Forwards a tuning change to the reclaimer.
    pub fn set_tuning_percentage(&self, percent: u32) -> Option<u32> {
        self.reclaimer.set_tuning_percentage(percent)
    }

    /// Summarizes the most recent pauses.
    pub fn pause_summary(&self) -> PauseSummary {
        let history = match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut sorted = history.recent.iter().copied().collect::<Vec<_>>();
        sorted.sort_unstable();

        match (sorted.first(), sorted.last()) {
            (Some(min), Some(max)) => PauseSummary {
                min: *min,
                median: sorted[sorted.len() / 2],
                max: *max,
                cycles: history.cycles,
            },
            _ => PauseSummary::default(),
        }
    }

    fn record(&self, pause: Duration) {
        let mut history = match self.history.lock() {
            Ok(history) => history,
            Err(poisoned) => poisoned.into_inner(),
        };

        if history.recent.len() == RECENT_PAUSES_LEN {
            history.recent.pop_front();
        }
        history.recent.push_back(pause);
        history.cycles += 1;
    }
}

impl Default for MemoryReclaim {
    fn default() -> Self {
        Self::new(SystemReclaimer)
    }
}
