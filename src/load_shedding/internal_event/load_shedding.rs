use metrics::{counter, histogram};

use super::InternalEvent;

#[derive(Clone, Copy, Debug)]
pub struct RequestRateObserved {
    pub rate: f64,
}

impl InternalEvent for RequestRateObserved {
    fn emit(self) {
        // One sample per evaluated request; a histogram keeps the shape of
        // the distribution across the reporting interval.
        histogram!("load_shed_request_rate").record(self.rate);
        trace!(
            target: "load_shedding::stats",
            rate = self.rate,
            "Request rate observed."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CpuAverageObserved {
    pub average: f64,
}

impl InternalEvent for CpuAverageObserved {
    fn emit(self) {
        histogram!("load_shed_cpu_percent_average").record(self.average);
        trace!(
            target: "load_shedding::stats",
            cpu_percent_average = self.average,
            "CPU trigger checked."
        );
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateTriggerEvaluated {
    pub rate: f64,
}

impl InternalEvent for RateTriggerEvaluated {
    fn emit(self) {
        histogram!("load_shed_trigger_request_rate").record(self.rate);
        trace!(
            target: "load_shedding::stats",
            rate = self.rate,
            "Request-rate trigger checked."
        );
    }
}

/// Per-second shed report, emitted only for seconds in which requests were
/// rejected.
#[derive(Clone, Copy, Debug)]
pub struct SheddingReported {
    pub accepted: u64,
    pub rejected: u64,
}

impl InternalEvent for SheddingReported {
    fn emit(self) {
        counter!("load_shed_requests_accepted_total").increment(self.accepted);
        counter!("load_shed_requests_rejected_total").increment(self.rejected);
        info!(
            target: "load_shedding::stats",
            accepted = self.accepted,
            rejected = self.rejected,
            "Load shedding active."
        );
    }
}
