use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use classbook::config::Config;
use classbook::engine::{BookingOutcome, Engine, EngineOptions, LockTable, SeriesRequest, WalStore};
use classbook::notify::NotifyHub;

/// How many times a request is replayed after a lock timeout.
const RETRY_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    classbook::observability::init(config.metrics_port)?;

    let requests_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .ok_or("usage: classbook <requests.json>")?;

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(WalStore::open(config.wal_path(), Arc::new(NotifyHub::new()))?);
    let engine = Engine::new(store.clone(), Arc::new(LockTable::new()), EngineOptions::from(&config));

    info!("classbook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  lock_timeout: {}ms", config.lock_timeout_ms);
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let raw = std::fs::read_to_string(&requests_path)?;
    let requests: Vec<SeriesRequest> = serde_json::from_str(&raw)?;
    info!(count = requests.len(), path = %requests_path.display(), "submitting series requests");

    let mut committed = 0usize;
    for (i, request) in requests.into_iter().enumerate() {
        let result = engine.create_series_retrying(request, RETRY_ATTEMPTS).await;
        if let Ok(booking) = &result {
            for notice in &booking.notices {
                info!(request = i, ?notice, "notice");
            }
        }
        match BookingOutcome::from_result(&result) {
            BookingOutcome::Committed(id) => {
                committed += 1;
                info!(request = i, series_id = %id, "committed");
            }
            BookingOutcome::Rejected { kind, detail } => {
                tracing::warn!(request = i, ?kind, "rejected: {detail}");
            }
        }
    }

    store.compact_if_needed(config.compact_threshold).await?;
    info!(committed, "classbook finished");
    Ok(())
}
