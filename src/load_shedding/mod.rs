//! Shed a calibrated fraction of incoming requests under overload.

mod capacity;
mod rate;
mod shedder;
mod trigger;
mod usage;

pub mod event_bus;
pub mod internal_event;
pub mod layer;
pub mod service;

pub use event_bus::{Event, EventBus, Signal, Subscription};
pub use layer::LoadShedLayer;
pub use service::LoadShed;
pub use shedder::{Shedder, Verdict};
pub use usage::{CpuProbe, ProbeError, SysinfoProbe};

use bon::Builder;
use serde::Deserialize;
use snafu::{Snafu, ensure};

fn instant_now() -> std::time::Instant {
    tokio::time::Instant::now().into()
}

/// Configuration of the load-shedding engine.
///
/// Exactly one trigger mode is active per installation: setting
/// `request_rate_threshold` selects the request-rate trigger and overrides
/// `cpu_threshold`. Configuring neither is a fatal installation error.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `cpu_threshold` | unset | Process CPU percentage above which the moving average latches the overload trigger. May exceed 100 on multi-core hosts. |
/// | `request_rate_threshold` | unset | Requests/second above which the rate trigger fires. When set, takes precedence over `cpu_threshold`. |
/// | `min_capacity` | 10.0 | Floor for the learned sustainable throughput, in requests/second. The estimator never reports less than this. |
/// | `health_check` | unset | Exact request path exempted from shedding (and from rate accounting). |
#[derive(Clone, Debug, Builder, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadShedderSettings {
    /// CPU utilization threshold, as a percentage of one core.
    pub(super) cpu_threshold: Option<f64>,

    /// Request-rate threshold in requests per second.
    ///
    /// Mutually exclusive with the CPU trigger; wins when both are set.
    pub(super) request_rate_threshold: Option<f64>,

    /// Lower bound on the learned capacity, in requests per second.
    ///
    /// Pick the throughput the service is known to sustain even on a bad day;
    /// the estimator only learns upward from here while traffic is healthy.
    #[builder(default = default_min_capacity())]
    #[serde(default = "default_min_capacity")]
    pub(super) min_capacity: f64,

    /// Request path that bypasses shedding entirely, e.g. `/healthz`.
    #[builder(into)]
    pub(super) health_check: Option<String>,
}

const fn default_min_capacity() -> f64 {
    10.0
}

impl Default for LoadShedderSettings {
    fn default() -> Self {
        Self {
            cpu_threshold: None,
            request_rate_threshold: None,
            min_capacity: default_min_capacity(),
            health_check: None,
        }
    }
}

impl LoadShedderSettings {
    /// Resolve which trigger this installation runs, rejecting unusable
    /// configurations up front so no request ever sees a config failure.
    pub(super) fn trigger_mode(&self) -> Result<TriggerMode, ConfigError> {
        ensure!(
            self.min_capacity.is_finite() && self.min_capacity >= 0.0,
            InvalidMinCapacitySnafu {
                value: self.min_capacity
            }
        );

        if let Some(threshold) = self.request_rate_threshold {
            ensure!(
                threshold.is_finite() && threshold > 0.0,
                InvalidThresholdSnafu {
                    option: "request_rate_threshold",
                    value: threshold,
                }
            );
            return Ok(TriggerMode::RequestRate { threshold });
        }

        if let Some(threshold) = self.cpu_threshold {
            ensure!(
                threshold.is_finite() && threshold > 0.0,
                InvalidThresholdSnafu {
                    option: "cpu_threshold",
                    value: threshold,
                }
            );
            return Ok(TriggerMode::Cpu { threshold });
        }

        MissingTriggerSnafu.fail()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(super) enum TriggerMode {
    Cpu { threshold: f64 },
    RequestRate { threshold: f64 },
}

/// Fatal installation-time configuration errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(super)))]
pub enum ConfigError {
    #[snafu(display("either `cpu_threshold` or `request_rate_threshold` must be set"))]
    MissingTrigger,

    #[snafu(display("`{option}` must be finite and greater than zero, got {value}"))]
    InvalidThreshold { option: &'static str, value: f64 },

    #[snafu(display("`min_capacity` must be finite and non-negative, got {value}"))]
    InvalidMinCapacity { value: f64 },

    #[snafu(display("could not initialize the CPU usage probe: {source}"))]
    CpuProbe { source: ProbeError },
}
