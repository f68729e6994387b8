//! Process CPU usage sampling and the bounded moving-average window.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::{OptionExt, Snafu};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time::MissedTickBehavior;

/// How many samples the moving-average window retains.
pub(super) const USAGE_WINDOW_SAMPLES: usize = 10;

/// Cadence of the background CPU sampler.
pub(super) const CPU_SAMPLE_PERIOD: Duration = Duration::from_millis(500);

/// Bounded window of recent CPU samples with a running sum.
///
/// Eviction happens before append, so the window never holds more than
/// [`USAGE_WINDOW_SAMPLES`] entries and the sum always matches the queued
/// samples exactly.
#[derive(Debug, Default)]
pub(super) struct UsageWindow {
    samples: VecDeque<f64>,
    sum: f64,
}

impl UsageWindow {
    pub(super) fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(USAGE_WINDOW_SAMPLES),
            sum: 0.0,
        }
    }

    pub(super) fn push(&mut self, sample: f64) {
        if self.samples.len() == USAGE_WINDOW_SAMPLES {
            if let Some(evicted) = self.samples.pop_front() {
                self.sum -= evicted;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    /// Arithmetic mean of the queued samples, or 0 while the window is empty.
    pub(super) fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }
}

/// Capability that yields the current process CPU utilization on demand.
///
/// The value is a percentage of one core and may exceed 100 on multi-core
/// hosts. Implementations are polled only from the background sampler task,
/// never from the request path, so they may be arbitrarily slow.
pub trait CpuProbe: Send + 'static {
    fn cpu_percent(&mut self) -> Result<f64, ProbeError>;
}

/// Errors raised by CPU measurement.
///
/// These never surface to request callers; a failed measurement skips the
/// sample and leaves the window unchanged.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum ProbeError {
    #[snafu(display("could not resolve the current process id: {reason}"))]
    PidUnavailable { reason: &'static str },

    #[snafu(display("process {pid} is not visible to the system"))]
    ProcessMissing { pid: Pid },
}

/// [`CpuProbe`] backed by the `sysinfo` crate.
pub struct SysinfoProbe {
    system: System,
    pid: Pid,
}

impl SysinfoProbe {
    /// Create a probe for the current process and take the initial reading
    /// `sysinfo` needs before CPU deltas become meaningful.
    pub fn new() -> Result<Self, ProbeError> {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(reason) => return PidUnavailableSnafu { reason }.fail(),
        };

        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        Ok(Self { system, pid })
    }
}

impl std::fmt::Debug for SysinfoProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProbe")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl CpuProbe for SysinfoProbe {
    fn cpu_percent(&mut self) -> Result<f64, ProbeError> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.system
            .process(self.pid)
            .map(|process| f64::from(process.cpu_usage()))
            .context(ProcessMissingSnafu { pid: self.pid })
    }
}

/// Background task feeding the shared usage window from the probe.
///
/// A failed measurement is logged and skipped; the window keeps its previous
/// contents so the trigger continues to act on the last known good samples.
pub(super) async fn sample_cpu(mut probe: impl CpuProbe, window: Arc<Mutex<UsageWindow>>) {
    let mut ticker = tokio::time::interval(CPU_SAMPLE_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match probe.cpu_percent() {
            Ok(sample) => window.lock().unwrap().push(sample),
            Err(error) => {
                warn!(message = "Failed to read process CPU usage; skipping sample.", %error);
            }
        }
    }
}
