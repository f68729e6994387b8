//! Overload triggers: CPU moving average with hysteresis, or raw request rate.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::event_bus::{Event, EventBus};
use super::instant_now;
use super::internal_event::{CpuAverageObserved, RateTriggerEvaluated, emit};
use super::usage::UsageWindow;

/// Minimum time the CPU trigger stays latched after a positive check.
pub(super) const TRIGGER_HOLD: Duration = Duration::from_millis(1000);

/// The release threshold sits below the latch threshold by this factor.
pub(super) const RECOVERY_RATIO: f64 = 0.9;

#[derive(Debug, Default)]
struct TriggerState {
    is_triggered: bool,
    triggered_at: Option<Instant>,
}

/// Level-triggered CPU overload detector with hold-and-decay hysteresis.
///
/// A moving average above `threshold` latches the triggered state. The state
/// releases only once the average has fallen under `recovery_threshold` and at
/// least [`TRIGGER_HOLD`] has passed since the last positive check, which
/// keeps a noisy signal from flapping the shedder on and off.
#[derive(Debug)]
pub(super) struct CpuTrigger {
    threshold: f64,
    recovery_threshold: f64,
    window: Arc<Mutex<UsageWindow>>,
    state: Mutex<TriggerState>,
    bus: Arc<EventBus>,
}

impl CpuTrigger {
    pub(super) fn new(threshold: f64, window: Arc<Mutex<UsageWindow>>, bus: Arc<EventBus>) -> Self {
        Self {
            threshold,
            recovery_threshold: threshold * RECOVERY_RATIO,
            window,
            state: Mutex::new(TriggerState::default()),
            bus,
        }
    }

    pub(super) fn has_triggered(&self) -> bool {
        let average = self.window.lock().unwrap().average();
        emit(CpuAverageObserved { average });
        self.bus.emit(Event::TriggerCpu { average });

        let mut state = self.state.lock().unwrap();
        let now = instant_now();

        let held = state
            .triggered_at
            .is_some_and(|triggered_at| now.duration_since(triggered_at) < TRIGGER_HOLD);
        let triggered = average > self.threshold
            || (state.is_triggered && average > self.recovery_threshold)
            || held;

        if triggered {
            state.triggered_at = Some(now);
        }
        state.is_triggered = triggered;

        triggered
    }
}

/// Stateless rate trigger: fires whenever the live rate exceeds the threshold.
#[derive(Debug)]
pub(super) struct RequestRateTrigger {
    threshold: f64,
    bus: Arc<EventBus>,
}

impl RequestRateTrigger {
    pub(super) fn new(threshold: f64, bus: Arc<EventBus>) -> Self {
        Self { threshold, bus }
    }

    pub(super) fn has_triggered(&self, request_rate: f64) -> bool {
        emit(RateTriggerEvaluated { rate: request_rate });
        self.bus.emit(Event::TriggerRequestRate { rate: request_rate });

        request_rate > self.threshold
    }
}

/// The trigger variant selected at installation time.
#[derive(Debug)]
pub(super) enum Trigger {
    Cpu(CpuTrigger),
    RequestRate(RequestRateTrigger),
}

impl Trigger {
    /// The rate argument only matters to the rate variant; the CPU variant
    /// reads its own moving average instead.
    pub(super) fn has_triggered(&self, request_rate: f64) -> bool {
        match self {
            Self::Cpu(trigger) => trigger.has_triggered(),
            Self::RequestRate(trigger) => trigger.has_triggered(request_rate),
        }
    }
}
