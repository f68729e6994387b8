//! Combines trigger, rate counter, and capacity estimate into a per-request
//! admit/reject verdict.

use std::sync::Arc;

use super::capacity::CapacityEstimator;
use super::event_bus::{Event, EventBus};
use super::internal_event::{RequestRateObserved, emit};
use super::rate::RequestRateCounter;
use super::trigger::Trigger;

/// The per-request admission decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Reject,
}

impl Verdict {
    pub const fn is_admit(&self) -> bool {
        matches!(self, Verdict::Admit)
    }

    pub const fn is_reject(&self) -> bool {
        matches!(self, Verdict::Reject)
    }
}

/// Per-installation decision engine.
///
/// Owns its rate counter and capacity estimator outright; only the event bus
/// is shared with the background tasks. Evaluation is synchronous and
/// lock-bounded, safe to run inline on every request.
#[derive(Debug)]
pub struct Shedder {
    trigger: Trigger,
    request_counter: RequestRateCounter,
    capacity_estimator: CapacityEstimator,
    bus: Arc<EventBus>,
}

impl Shedder {
    pub(super) fn new(trigger: Trigger, min_capacity: f64, bus: Arc<EventBus>) -> Self {
        Self {
            trigger,
            request_counter: RequestRateCounter::new(),
            capacity_estimator: CapacityEstimator::new(min_capacity),
            bus,
        }
    }

    /// Decide whether one incoming request is admitted.
    ///
    /// Under overload the request is discarded with probability
    /// `(rate - capacity) / rate`. A non-positive overload (the CPU trigger
    /// fired but request volume sits at or below capacity) can never reject,
    /// which reconciles a CPU-based trigger with rate-based shedding math.
    /// While healthy, the observed rate feeds the capacity estimator instead.
    pub fn eval_request(&self) -> Verdict {
        self.request_counter.increment();
        let rate = self.request_counter.rate();

        let verdict = if self.trigger.has_triggered(rate) {
            self.capacity_estimator.freeze();
            if should_discard(rate, self.capacity_estimator.capacity()) {
                Verdict::Reject
            } else {
                Verdict::Admit
            }
        } else {
            self.capacity_estimator.update_capacity(rate);
            Verdict::Admit
        };

        emit(RequestRateObserved { rate });
        self.bus.emit(Event::RequestRate { rate });

        verdict
    }
}

fn should_discard(rate: f64, capacity: f64) -> bool {
    let overload = rate - capacity;
    let proportion = overload / rate;
    proportion > 0.0 && rand::random::<f64>() <= proportion
}
