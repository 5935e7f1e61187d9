use std::sync::Arc;

use tracing::info;

use courtside::config::ServiceConfig;
use courtside::notify::LogNotifier;
use courtside::tenant::TenantManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    courtside::observability::init_tracing();

    let config = ServiceConfig::from_env();
    courtside::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let tenants = TenantManager::new(
        config.data_dir.clone(),
        config.engine.clone(),
        Arc::new(LogNotifier),
    );

    // Every WAL in the data dir is a tenant; load them so their sweeps run
    for entry in std::fs::read_dir(&config.data_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("wal") {
            continue;
        }
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let engine = tenants.get_or_create(name)?;
        for court in engine.list_courts().await {
            let pairs = engine.detect_double_bookings(court.id).await?;
            if !pairs.is_empty() {
                tracing::error!("tenant {name}: court {} has overlapping bookings {pairs:?}", court.id);
            }
        }
    }

    info!("courtside running");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  tenants: {}", tenants.tenant_count());
    info!(
        "  reservation window: {} min, waitlist depth {}",
        config.engine.reservation_window_minutes, config.engine.waitlist_depth
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    tokio::signal::ctrl_c().await?;
    info!("courtside stopped");
    Ok(())
}
