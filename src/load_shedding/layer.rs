//! Installation: wires the engine together and runs its background tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::ResultExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower::Layer;

use super::event_bus::{Event, EventBus};
use super::internal_event::{SheddingReported, emit};
use super::service::LoadShed;
use super::shedder::Shedder;
use super::trigger::{CpuTrigger, RequestRateTrigger, Trigger};
use super::usage::{CpuProbe, SysinfoProbe, UsageWindow, sample_cpu};
use super::{ConfigError, CpuProbeSnafu, LoadShedderSettings, TriggerMode};

/// Cadence of the per-second shed report.
pub(super) const TALLY_FLUSH_PERIOD: Duration = Duration::from_secs(1);

/// Per-second accepted/rejected counters, reset on every flush.
#[derive(Debug, Default)]
pub(super) struct Tallies {
    pub(super) accepted: AtomicU64,
    pub(super) rejected: AtomicU64,
}

/// One installed engine: the shedder, its telemetry, and the handles of its
/// background tasks. Dropped when the last layer/service clone goes away,
/// which also aborts the tasks.
#[derive(Debug)]
pub(super) struct Engine {
    pub(super) shedder: Shedder,
    pub(super) tallies: Arc<Tallies>,
    pub(super) bus: Arc<EventBus>,
    pub(super) health_check: Option<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Engine {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Attaches the load-shedding engine to a service stack.
///
/// Each layer owns one engine instance; clones of the layer (and the services
/// it produces) share that instance. Separate installations are fully
/// independent, including their event buses and learned capacity.
///
/// Must be constructed inside a tokio runtime: installation spawns the CPU
/// sampler (CPU mode only) and the per-second telemetry flush task.
#[derive(Clone, Debug)]
pub struct LoadShedLayer {
    engine: Arc<Engine>,
}

impl LoadShedLayer {
    /// Validate the settings and install the engine, measuring CPU with the
    /// default `sysinfo`-backed probe when the CPU trigger is selected.
    pub fn new(settings: LoadShedderSettings) -> Result<Self, ConfigError> {
        match settings.trigger_mode()? {
            TriggerMode::Cpu { .. } => {
                let probe = SysinfoProbe::new().context(CpuProbeSnafu)?;
                Self::install(settings, Some(probe))
            }
            TriggerMode::RequestRate { .. } => Self::install::<SysinfoProbe>(settings, None),
        }
    }

    /// Install with a caller-supplied CPU probe.
    ///
    /// The probe is ignored when the settings select the request-rate
    /// trigger.
    pub fn with_probe<P: CpuProbe>(
        settings: LoadShedderSettings,
        probe: P,
    ) -> Result<Self, ConfigError> {
        Self::install(settings, Some(probe))
    }

    fn install<P: CpuProbe>(
        settings: LoadShedderSettings,
        probe: Option<P>,
    ) -> Result<Self, ConfigError> {
        let mode = settings.trigger_mode()?;
        let bus = Arc::new(EventBus::new());
        let mut tasks = Vec::with_capacity(2);

        let trigger = match mode {
            TriggerMode::Cpu { threshold } => {
                let window = Arc::new(Mutex::new(UsageWindow::new()));
                if let Some(probe) = probe {
                    tasks.push(tokio::spawn(sample_cpu(probe, Arc::clone(&window))));
                }
                Trigger::Cpu(CpuTrigger::new(threshold, window, Arc::clone(&bus)))
            }
            TriggerMode::RequestRate { threshold } => {
                Trigger::RequestRate(RequestRateTrigger::new(threshold, Arc::clone(&bus)))
            }
        };

        let shedder = Shedder::new(trigger, settings.min_capacity, Arc::clone(&bus));
        let tallies = Arc::new(Tallies::default());
        tasks.push(tokio::spawn(flush_tallies(
            Arc::clone(&tallies),
            Arc::clone(&bus),
        )));

        Ok(Self {
            engine: Arc::new(Engine {
                shedder,
                tallies,
                bus,
                health_check: settings.health_check,
                tasks,
            }),
        })
    }

    /// The bus carrying this installation's telemetry signals.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.engine.bus)
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShed<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShed::new(inner, Arc::clone(&self.engine))
    }
}

/// Once per second, report and reset the accepted/rejected tallies.
///
/// The report is emitted only for seconds in which rejections occurred, so
/// observers see a throttled rejection-rate signal rather than one event per
/// rejected request.
async fn flush_tallies(tallies: Arc<Tallies>, bus: Arc<EventBus>) {
    let mut ticker = tokio::time::interval(TALLY_FLUSH_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The zeroth tick fires immediately; skip it so every report covers a
    // full second.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let accepted = tallies.accepted.swap(0, Ordering::Relaxed);
        let rejected = tallies.rejected.swap(0, Ordering::Relaxed);

        if rejected > 0 {
            emit(SheddingReported { accepted, rejected });
            bus.emit(Event::LoadSheddingTriggered { accepted, rejected });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use http::{Request, Response, StatusCode};
    use tower::{Service, ServiceExt, service_fn};

    use super::*;
    use crate::load_shedding::Signal;
    use crate::load_shedding::usage::ProbeError;

    struct ConstProbe(f64);

    impl CpuProbe for ConstProbe {
        fn cpu_percent(&mut self) -> Result<f64, ProbeError> {
            Ok(self.0)
        }
    }

    fn request() -> Request<&'static str> {
        Request::builder().uri("/work").body("payload").unwrap()
    }

    async fn echo(_req: Request<&'static str>) -> Result<Response<String>, Infallible> {
        Ok(Response::new(String::new()))
    }

    #[tokio::test]
    async fn installation_rejects_unusable_configuration() {
        let result = LoadShedLayer::new(LoadShedderSettings::default());
        assert!(matches!(result, Err(ConfigError::MissingTrigger)));

        let settings = LoadShedderSettings::builder().cpu_threshold(-1.0).build();
        assert!(matches!(
            LoadShedLayer::new(settings),
            Err(ConfigError::InvalidThreshold { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn installations_do_not_interfere() {
        let settings = LoadShedderSettings::builder()
            .request_rate_threshold(1_000_000.0)
            .build();
        let first = LoadShedLayer::new(settings.clone()).unwrap();
        let second = LoadShedLayer::new(settings).unwrap();

        assert!(!Arc::ptr_eq(&first.engine, &second.engine));
        assert!(!Arc::ptr_eq(&first.events(), &second.events()));

        let mut service = first.layer(service_fn(echo));
        for _ in 0..10 {
            service.ready().await.unwrap().call(request()).await.unwrap();
        }

        assert_eq!(first.engine.tallies.accepted.load(Ordering::Relaxed), 10);
        assert_eq!(second.engine.tallies.accepted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shed_reports_aggregate_per_second() {
        let settings = LoadShedderSettings::builder()
            .cpu_threshold(80.0)
            .min_capacity(0.0)
            .build();
        let layer = LoadShedLayer::with_probe(settings, ConstProbe(95.0)).unwrap();

        let reports = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&reports);
        layer.events().subscribe(Signal::LoadSheddingTriggered, move |event| {
            if let Event::LoadSheddingTriggered { accepted, rejected } = *event {
                observed.lock().unwrap().push((accepted, rejected));
            }
        });

        let mut service = layer.layer(service_fn(echo));

        // Fill the usage window, landing between flush ticks so the burst is
        // attributed to exactly one second. The first request is admitted at
        // rate 0; everything after it is rejected because the capacity floor
        // is 0.
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        service.ready().await.unwrap().call(request()).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        for _ in 0..20 {
            let response = service.ready().await.unwrap().call(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        }

        // Cross the next flush boundary.
        tokio::time::sleep(TALLY_FLUSH_PERIOD + Duration::from_millis(100)).await;

        let observed_so_far = {
            let reports = reports.lock().unwrap();
            assert_eq!(reports.as_slice(), &[(1, 20)]);
            reports.len()
        };

        // Quiet seconds produce no report.
        tokio::time::sleep(TALLY_FLUSH_PERIOD * 2).await;
        assert_eq!(reports.lock().unwrap().len(), observed_so_far);
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_cpu_overload_sheds_most_traffic() {
        let settings = LoadShedderSettings::builder()
            .cpu_threshold(80.0)
            .min_capacity(10.0)
            .build();
        let layer = LoadShedLayer::with_probe(settings, ConstProbe(95.0)).unwrap();

        let reports = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::clone(&reports);
        layer.events().subscribe(Signal::LoadSheddingTriggered, move |event| {
            if let Event::LoadSheddingTriggered { accepted, rejected } = *event {
                observed.lock().unwrap().push((accepted, rejected));
            }
        });

        let mut service = layer.layer(service_fn(echo));
        tokio::time::sleep(Duration::from_millis(3_100)).await;

        // Five seconds of ~100 requests/second against a learned capacity of
        // 10: the discard proportion sits near 0.9.
        for _ in 0..5 {
            for _ in 0..100 {
                let _ = service.ready().await.unwrap().call(request()).await.unwrap();
                tokio::time::advance(Duration::from_millis(10)).await;
            }
        }

        let reports = reports.lock().unwrap();
        assert!(
            reports.len() >= 4,
            "expected a shed report for nearly every second, got {}",
            reports.len()
        );

        let accepted: u64 = reports.iter().map(|(accepted, _)| accepted).sum();
        let rejected: u64 = reports.iter().map(|(_, rejected)| rejected).sum();
        let total = accepted + rejected;
        let rejection_ratio = rejected as f64 / total as f64;
        assert!(
            (0.75..1.0).contains(&rejection_ratio),
            "expected ~90% rejected, got {rejection_ratio} ({rejected}/{total})"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_never_triggers_shedding() {
        struct BrokenProbe;

        impl CpuProbe for BrokenProbe {
            fn cpu_percent(&mut self) -> Result<f64, ProbeError> {
                Err(ProbeError::PidUnavailable { reason: "broken" })
            }
        }

        let settings = LoadShedderSettings::builder()
            .cpu_threshold(80.0)
            .min_capacity(0.0)
            .build();
        let layer = LoadShedLayer::with_probe(settings, BrokenProbe).unwrap();
        let mut service = layer.layer(service_fn(echo));

        tokio::time::sleep(Duration::from_secs(3)).await;

        // The usage window never fills, the average reads 0, and every
        // request is admitted.
        for _ in 0..50 {
            let response = service.ready().await.unwrap().call(request()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            tokio::time::advance(Duration::from_millis(10)).await;
        }
    }
}
