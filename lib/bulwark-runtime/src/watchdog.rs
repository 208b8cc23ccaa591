//! Resource watchdog.
//!
//! The watchdog periodically samples the resources held by the process, publishes them as gauges, and requests a
//! graceful restart once any of them reaches its configured limit.

use metrics::{gauge, Gauge};
use process_stats::Sampler;
use serde::Serialize;
use tokio::{runtime::Handle, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info};

use crate::{
    config::WatchdogConfiguration,
    reclaim::MemoryReclaim,
    registry::{AppStats, RegistryError, RequestRegistry},
    restart::RestartTrigger,
};

/// Resource usage of the process at a point in time.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ResourceSample {
    /// Resident memory, in bytes.
    pub sys_mem_bytes: u64,

    /// Live heap allocations, in bytes.
    pub alloc_mem_bytes: u64,

    /// Open file descriptors.
    pub num_fds: u64,

    /// Live asynchronous tasks.
    pub num_tasks: u64,
}

/// A source of [`ResourceSample`]s.
pub trait ResourceSampler: Send + 'static {
    /// Takes a sample. Counters that cannot be determined are reported as zero.
    fn sample(&mut self) -> ResourceSample;
}

/// Samples the current process, and counts the tasks alive on the current Tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessResourceSampler {
    sampler: Sampler,
}

impl ResourceSampler for ProcessResourceSampler {
    fn sample(&mut self) -> ResourceSample {
        let process = self.sampler.sample();
        let num_tasks = Handle::try_current()
            .map(|handle| handle.metrics().num_alive_tasks() as u64)
            .unwrap_or_default();

        ResourceSample {
            sys_mem_bytes: process.resident_bytes.unwrap_or_default(),
            alloc_mem_bytes: process.live_heap_bytes.unwrap_or_default(),
            num_fds: process.open_fds.unwrap_or_default(),
            num_tasks,
        }
    }
}

struct Telemetry {
    sys_mem: Gauge,
    alloc_mem: Gauge,
    num_fds: Gauge,
    num_tasks: Gauge,
}

impl Telemetry {
    fn new() -> Self {
        Self {
            sys_mem: gauge!("mem.sys"),
            alloc_mem: gauge!("mem.alloc"),
            num_fds: gauge!("numfds"),
            num_tasks: gauge!("numgoro"),
        }
    }

    fn publish(&self, sample: &ResourceSample) {
        self.sys_mem.set(sample.sys_mem_bytes as f64);
        self.alloc_mem.set(sample.alloc_mem_bytes as f64);
        self.num_fds.set(sample.num_fds as f64);
        self.num_tasks.set(sample.num_tasks as f64);
    }
}

/// Periodically checks process resources against their limits.
pub struct ResourceWatchdog<S = ProcessResourceSampler> {
    config: WatchdogConfiguration,
    sampler: S,
    registry: RequestRegistry,
    reclaim: MemoryReclaim,
    trigger: RestartTrigger,
}

impl ResourceWatchdog {
    /// Creates a new `ResourceWatchdog` that samples the current process.
    pub fn new(
        config: WatchdogConfiguration, registry: RequestRegistry, reclaim: MemoryReclaim, trigger: RestartTrigger,
    ) -> Self {
        Self {
            config,
            sampler: ProcessResourceSampler::default(),
            registry,
            reclaim,
            trigger,
        }
    }
}

impl<S> ResourceWatchdog<S>
where
    S: ResourceSampler,
{
    /// Replaces the resource sampler.
    pub fn with_sampler<S2>(self, sampler: S2) -> ResourceWatchdog<S2> {
        ResourceWatchdog {
            config: self.config,
            sampler,
            registry: self.registry,
            reclaim: self.reclaim,
            trigger: self.trigger,
        }
    }

    /// Spawns the watchdog on the current runtime.
    ///
    /// The watchdog runs until the request registry stops.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let telemetry = Telemetry::new();
        let mut interval = tokio::time::interval(self.config.period());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(period = ?self.config.period(), "Resource watchdog running.");

        let mut first_tick = true;
        loop {
            interval.tick().await;
            if let Err(e) = self.tick(&telemetry, first_tick).await {
                debug!(error = %e, "Resource watchdog stopping.");
                break;
            }
            first_tick = false;
        }
    }

    async fn tick(&mut self, telemetry: &Telemetry, first_tick: bool) -> Result<(), RegistryError> {
        let stats = self.registry.stats().await?;
        let sample = self.sampler.sample();
        let pauses = self.reclaim.pause_summary();

        info!(
            sys = sample.sys_mem_bytes,
            alloc = sample.alloc_mem_bytes,
            fds = sample.num_fds,
            current_req = stats.current_requests,
            total_req = stats.total_requests,
            tasks = sample.num_tasks,
            reclaim_pauses = %pauses,
            "TICK"
        );

        // Gauges start from zero so that a restarted process shows up as a drop rather than a continuation.
        if first_tick {
            telemetry.publish(&ResourceSample::default());
        } else {
            telemetry.publish(&sample);
        }

        for reason in self.breaches(&sample, &stats) {
            self.trigger.request(reason);
        }
        Ok(())
    }

    fn breaches(&self, sample: &ResourceSample, stats: &AppStats) -> Vec<String> {
        let limits = [
            ("Sys memory", sample.sys_mem_bytes, self.config.sysmem_bytes_limit),
            ("Alloc memory", sample.alloc_mem_bytes, self.config.allocmem_bytes_limit),
            ("Number of fds", sample.num_fds, self.config.numfds_limit),
            ("Number of tasks", sample.num_tasks, self.config.numgoros_limit),
        ];

        let mut reasons = Vec::new();
        for (name, value, limit) in limits {
            if limit > 0 && value >= limit {
                error!(value, limit, "{} limit reached.", name);
                reasons.push(format!("{} limit reached [{} >= {}]", name, value, limit));
            }
        }

        let uptime = stats.uptime().as_secs_f64();
        if self.config.restart_after_secs > 0.0 && uptime > self.config.restart_after_secs {
            error!(uptime, limit = self.config.restart_after_secs, "Run time limit reached.");
            reasons.push(format!(
                "Run time limit reached [{:.1}s > {}s]",
                uptime, self.config.restart_after_secs
            ));
        }

        if self.config.max_requests > 0 && stats.total_requests > self.config.max_requests {
            error!(
                total = stats.total_requests,
                limit = self.config.max_requests,
                "Request limit reached."
            );
            reasons.push(format!(
                "Request limit reached [{} > {}]",
                stats.total_requests, self.config.max_requests
            ));
        }

        reasons
    }
}
