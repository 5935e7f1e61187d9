use std::sync::Arc;

use tracing::info;

use crate::engine::Engine;
use crate::model::Ms;

/// Background task that expires overdue reservations and restarts any
/// cascade left waiting.
pub async fn run_reaper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(engine.config.sweep_interval);
    loop {
        interval.tick().await;
        sweep(&engine, chrono::Utc::now().timestamp_millis()).await;
    }
}

/// One reaper pass. Returns how many reservations were expired.
pub async fn sweep(engine: &Engine, now: Ms) -> usize {
    let mut reaped = 0;
    for (entry_id, _court_id) in engine.collect_expired_reservations(now) {
        match engine.expire_reservation_at(entry_id, now).await {
            Ok(true) => {
                reaped += 1;
                info!("reaped expired reservation {entry_id}");
            }
            // Already redeemed or expired by a request in the meantime
            Ok(false) => {}
            Err(e) => tracing::debug!("reaper skip {entry_id}: {e}"),
        }
    }
    if let Err(e) = engine.resume_stalled_cascades(now).await {
        tracing::warn!("resuming waitlist cascades failed: {e}");
    }
    reaped
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(engine.config.compact_interval);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < engine.config.compact_threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
