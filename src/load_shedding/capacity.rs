//! Learns the sustainable request throughput from healthy traffic.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::instant_now;

/// How long a provisional observation window stays open before it is merged
/// into the baseline.
pub(super) const CAPACITY_DECAY_PERIOD: Duration = Duration::from_millis(300_000);

#[derive(Clone, Copy, Debug)]
struct Provisional {
    capacity: f64,
    started_at: Instant,
}

#[derive(Debug)]
struct CapacityState {
    capacity: f64,
    provisional: Option<Provisional>,
}

/// Tracks the highest request rate the process has absorbed while healthy.
///
/// Inside each observation window the provisional figure follows the peak
/// admissible rate, not an average: capacity should reflect the highest load
/// the process actually handled. At a window boundary the baseline moves as
/// `(capacity + 2 * provisional) / 3`, weighted toward the fresh observation.
/// Because a fresh window is reseeded at the floor, a sustained drop in
/// achievable throughput lowers the learned ceiling over following windows.
#[derive(Debug)]
pub(super) struct CapacityEstimator {
    min_capacity: f64,
    state: Mutex<CapacityState>,
}

impl CapacityEstimator {
    pub(super) fn new(min_capacity: f64) -> Self {
        Self {
            min_capacity,
            state: Mutex::new(CapacityState {
                capacity: min_capacity,
                provisional: None,
            }),
        }
    }

    /// Feed one healthy-rate observation. Only call while the trigger is not
    /// latched; rates observed during overload are unsustainable by
    /// definition and must not raise the estimate.
    pub(super) fn update_capacity(&self, rate: f64) {
        let mut state = self.state.lock().unwrap();
        let now = instant_now();

        match state.provisional {
            None => {
                state.provisional = Some(Provisional {
                    capacity: self.min_capacity,
                    started_at: now,
                });
            }
            Some(provisional)
                if now.duration_since(provisional.started_at) > CAPACITY_DECAY_PERIOD =>
            {
                state.capacity = (state.capacity + 2.0 * provisional.capacity) / 3.0;
                state.provisional = Some(Provisional {
                    capacity: self.min_capacity,
                    started_at: now,
                });
            }
            Some(_) => {}
        }

        if let Some(provisional) = state.provisional.as_mut() {
            if rate > provisional.capacity {
                provisional.capacity = rate;
            }
        }
    }

    /// Pin the provisional figure to the current baseline.
    ///
    /// Called when the trigger fires: the rate just measured is the one that
    /// caused shedding, so it must not inflate future estimates.
    pub(super) fn freeze(&self) {
        let mut state = self.state.lock().unwrap();
        let capacity = state.capacity;
        if let Some(provisional) = state.provisional.as_mut() {
            provisional.capacity = capacity;
        }
    }

    /// Current baseline, never below the configured floor.
    pub(super) fn capacity(&self) -> f64 {
        self.state.lock().unwrap().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn starts_at_the_floor() {
        let estimator = CapacityEstimator::new(100.0);
        assert_eq!(estimator.capacity(), 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_moves_at_window_boundary() {
        let estimator = CapacityEstimator::new(100.0);

        estimator.update_capacity(150.0);
        // Observations inside the window track the peak without touching the
        // baseline.
        estimator.update_capacity(120.0);
        assert_eq!(estimator.capacity(), 100.0);

        tokio::time::advance(CAPACITY_DECAY_PERIOD + Duration::from_millis(1)).await;
        estimator.update_capacity(50.0);

        let expected = (100.0 + 2.0 * 150.0) / 3.0;
        assert!((estimator.capacity() - expected).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_can_decay_toward_the_floor() {
        let estimator = CapacityEstimator::new(100.0);

        estimator.update_capacity(400.0);
        tokio::time::advance(CAPACITY_DECAY_PERIOD + Duration::from_millis(1)).await;
        estimator.update_capacity(100.0);
        assert!((estimator.capacity() - 300.0).abs() < 1e-9);

        // The next window only ever sees the floor, so the merge pulls the
        // baseline back down.
        tokio::time::advance(CAPACITY_DECAY_PERIOD + Duration::from_millis(1)).await;
        estimator.update_capacity(100.0);
        let expected = (300.0 + 2.0 * 100.0) / 3.0;
        assert!((estimator.capacity() - expected).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn freeze_discards_unsustainable_peaks() {
        let estimator = CapacityEstimator::new(100.0);

        estimator.update_capacity(5000.0);
        estimator.freeze();

        tokio::time::advance(CAPACITY_DECAY_PERIOD + Duration::from_millis(1)).await;
        estimator.update_capacity(100.0);

        // The frozen provisional merged at the baseline value, not the peak.
        assert!((estimator.capacity() - 100.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn freeze_without_open_window_is_a_no_op() {
        let estimator = CapacityEstimator::new(100.0);
        estimator.freeze();
        assert_eq!(estimator.capacity(), 100.0);
    }
}
