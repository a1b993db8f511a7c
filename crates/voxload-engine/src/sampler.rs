//! Host resource sampling.
//!
//! Samplers are cheap synchronous reads, safe to call at 1 Hz or faster. A
//! sampler never fails its caller: when the platform cannot report a metric
//! the last known value is returned instead.

use parking_lot::Mutex;
use std::collections::VecDeque;
use sysinfo::{CpuExt, System, SystemExt};
use voxload_core::ResourceSample;

/// Source of CPU and memory utilization, both 0-100.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Samples the local host through `sysinfo`.
pub struct SystemSampler {
    system: Mutex<System>,
    last: Mutex<ResourceSample>,
}

impl SystemSampler {
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta between refreshes; prime the first one.
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            system: Mutex::new(system),
            last: Mutex::new(ResourceSample::new(0.0, 0.0)),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> ResourceSample {
        let (cpu, memory) = {
            let mut system = self.system.lock();
            system.refresh_cpu();
            system.refresh_memory();

            let cpu = f64::from(system.global_cpu_info().cpu_usage());
            let total = system.total_memory();
            let memory = if total == 0 {
                None
            } else {
                Some(system.used_memory() as f64 / total as f64 * 100.0)
            };
            (cpu, memory)
        };

        let mut last = self.last.lock();
        if cpu.is_finite() {
            last.cpu_percent = cpu.clamp(0.0, 100.0);
        } else {
            tracing::debug!("CPU usage unavailable, keeping last known value");
        }
        match memory {
            Some(memory) if memory.is_finite() => last.memory_percent = memory.clamp(0.0, 100.0),
            _ => tracing::debug!("Memory usage unavailable, keeping last known value"),
        }

        *last
    }
}

/// Returns the same sample on every call.
#[derive(Debug, Clone, Copy)]
pub struct StaticSampler {
    sample: ResourceSample,
}

impl StaticSampler {
    #[must_use]
    pub const fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            sample: ResourceSample::new(cpu_percent, memory_percent),
        }
    }

    /// A host with plenty of headroom.
    #[must_use]
    pub const fn idle() -> Self {
        Self::new(20.0, 30.0)
    }
}

impl ResourceSampler for StaticSampler {
    fn sample(&self) -> ResourceSample {
        self.sample
    }
}

/// Plays back a fixed sequence of samples, then repeats the last one.
///
/// `None` entries simulate a failed platform read and fall back to the last
/// known value.
pub struct ScriptedSampler {
    script: Mutex<VecDeque<Option<ResourceSample>>>,
    last: Mutex<ResourceSample>,
}

impl ScriptedSampler {
    #[must_use]
    pub fn new(script: Vec<Option<ResourceSample>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(ResourceSample::new(0.0, 0.0)),
        }
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&self) -> ResourceSample {
        let next = self.script.lock().pop_front().flatten();
        let mut last = self.last.lock();
        if let Some(sample) = next {
            *last = sample;
        }
        *last
    }
}
