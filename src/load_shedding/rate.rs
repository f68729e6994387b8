//! Request counting over a 1-second accounting window.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::instant_now;

/// Length of one accounting window.
pub(super) const RATE_WINDOW: Duration = Duration::from_millis(1000);

#[derive(Debug, Default)]
struct RateWindow {
    total: u64,
    started_at: Option<Instant>,
}

/// Counts requests in the currently open window and reports a live rate.
///
/// The rate is always computed against the still-open window, so it is a
/// responsive but noisy estimate near window boundaries. That trade-off is
/// deliberate: shedding decisions favor reacting quickly over smoothing.
#[derive(Debug, Default)]
pub(super) struct RequestRateCounter {
    window: Mutex<RateWindow>,
}

impl RequestRateCounter {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Count one request, opening a fresh window first if none is open or the
    /// current one has aged out.
    pub(super) fn increment(&self) {
        let mut window = self.window.lock().unwrap();
        let now = instant_now();

        let expired = window
            .started_at
            .is_none_or(|started_at| now.duration_since(started_at) > RATE_WINDOW);
        if expired {
            window.total = 0;
            window.started_at = Some(now);
        }

        window.total += 1;
    }

    /// Requests per second observed in the open window, or 0 when no window is
    /// open or no time has elapsed yet.
    pub(super) fn rate(&self) -> f64 {
        let window = self.window.lock().unwrap();
        let Some(started_at) = window.started_at else {
            return 0.0;
        };

        let elapsed = instant_now().duration_since(started_at).as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            window.total as f64 / elapsed
        }
    }
}
