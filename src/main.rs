use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use slotbook::config::Config;
use slotbook::engine::ReservationEngine;
use slotbook::gateway::BookingGateway;
use slotbook::notify::NotifyHub;
use slotbook::schedule;
use slotbook::store::WalStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    slotbook::observability::init(config.metrics_port)?;
    config.schedule.validate()?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(WalStore::open(&config.wal_path())?);
    let today = schedule::day_start(slotbook::model::now_ms());
    let seeded = schedule::seed_day(store.as_ref(), &config.schedule, today).await?;
    if seeded > 0 {
        info!("seeded {seeded} slots for today");
    }
    tokio::spawn(slotbook::compactor::run_compactor(
        store.clone(),
        config.compact_threshold,
    ));

    let engine = Arc::new(ReservationEngine::new(
        store,
        Arc::new(NotifyHub::new()),
        config.engine_config(),
    ));
    let gateway = Arc::new(BookingGateway::new(engine, config.gateway_config()));
    let semaphore = Arc::new(Semaphore::new(config.max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("slotbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!(
        "  schedule: {:02}:{:02}-{:02}:{:02}, {} min slots, capacity {}",
        config.schedule.open_minute / 60,
        config.schedule.open_minute % 60,
        config.schedule.close_minute / 60,
        config.schedule.close_minute % 60,
        config.schedule.slot_minutes,
        config.schedule.capacity
    );
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };

    slotbook::server::serve(listener, gateway, semaphore.clone(), shutdown).await;
    slotbook::server::drain(
        &semaphore,
        config.max_connections,
        std::time::Duration::from_secs(10),
    )
    .await;

    info!("slotbook stopped");
    Ok(())
}
