//! Internal events: each operational observation carries its own metrics and
//! log emission, so call sites stay free of instrumentation details.

mod load_shedding;

pub use load_shedding::{
    CpuAverageObserved, RateTriggerEvaluated, RequestRateObserved, SheddingReported,
};

pub trait InternalEvent {
    /// Record the event to metrics and the log.
    fn emit(self);
}

pub fn emit(event: impl InternalEvent) {
    event.emit();
}
