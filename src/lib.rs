//! Adaptive load shedding for request-serving processes.
//!
//! This crate provides middleware that watches a live load signal (process CPU
//! utilization or incoming request rate), learns the sustainable request
//! throughput from non-overloaded operation, and probabilistically rejects a
//! fraction of incoming requests once the signal indicates overload. Accepted
//! requests keep completing instead of the whole process collapsing under
//! unbounded queueing.
//!
//! # Algorithm Overview
//!
//! Per request, the shedder:
//! 1. Counts the request into a 1-second window and reads the live rate
//! 2. Asks the configured trigger (CPU moving average with hysteresis, or raw
//!    request rate) whether the process is overloaded
//! 3. Under overload, discards the request with probability
//!    `(rate - capacity) / rate`, where `capacity` is the learned sustainable
//!    throughput; otherwise it feeds the observed rate back into the capacity
//!    estimator and admits
//!
//! Rejected requests are answered with `503 Service Unavailable` and a jittered
//! `Retry-After` hint so clients back off without synchronizing their retries.
//!
//! # Basic Usage
//!
//! ```no_run
//! use adaptive_load_shed::load_shedding::{LoadShedLayer, LoadShedderSettings};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), adaptive_load_shed::Error> {
//! let settings = LoadShedderSettings::builder()
//!     .cpu_threshold(80.0)
//!     .min_capacity(50.0)
//!     .build();
//!
//! let service = tower::ServiceBuilder::new()
//!     .layer(LoadShedLayer::new(settings)?)
//!     .service_fn(|_req: http::Request<String>| async {
//!         Ok::<_, adaptive_load_shed::Error>(http::Response::new(String::new()))
//!     });
//! # drop(service);
//! # Ok(())
//! # }
//! ```
//!
//! # Safety & Concurrency
//!
//! Request evaluation is synchronous, lock-bounded, and performs no I/O; the
//! CPU probe runs on its own background cadence, never on the request path.
//! No unsafe code.
//!
//! # Telemetry
//!
//! Emits metrics via the `InternalEvent` trait and observer signals via
//! [`load_shedding::EventBus`].
pub mod load_shedding;

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
