//! Demonstration server: a deliberately CPU-hungry route behind the shedder.
//!
//! Run with `cargo run --example shed_server`, then hammer it:
//!
//! ```text
//! while true; do curl -s -o /dev/null -w "%{http_code}\n" localhost:3000/; done
//! ```
//!
//! Once the process CPU average crosses the threshold, a growing fraction of
//! requests comes back `503` with a `Retry-After` hint, while `/healthz`
//! keeps answering.

use adaptive_load_shed::load_shedding::{Event, LoadShedLayer, LoadShedderSettings, Signal};
use axum::{Router, routing::get};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), adaptive_load_shed::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = LoadShedderSettings::builder()
        .cpu_threshold(50.0)
        .min_capacity(10.0)
        .health_check("/healthz")
        .build();
    let shed = LoadShedLayer::new(settings)?;

    let events = shed.events();
    events.subscribe(Signal::LoadSheddingTriggered, |event| {
        if let Event::LoadSheddingTriggered { accepted, rejected } = *event {
            info!(accepted, rejected, "shed report for the last second");
        }
    });

    let app = Router::new()
        .route("/", get(burn))
        .route("/healthz", get(|| async { "ok" }))
        .layer(shed);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
    info!("demo server listening at http://127.0.0.1:3000");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn burn() -> &'static str {
    let mut acc = 0u64;
    for i in 0..100_000_000u64 {
        acc = acc.wrapping_add(i);
    }
    std::hint::black_box(acc);
    "Done!"
}
