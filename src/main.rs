use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use availd::cache::AvailabilityCache;
use availd::config::Config;
use availd::engine::Engine;
use availd::invalidation::InvalidationBus;
use availd::source::InMemoryStore;
use availd::sweeper::{self, PreloadPlan};
use availd::wire::{self, Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    availd::observability::init(config.metrics_port)?;

    let bus = Arc::new(InvalidationBus::new());
    let cache = Arc::new(AvailabilityCache::new(config.cache_ttl));
    let store = Arc::new(InMemoryStore::new(bus.clone()));
    let engine = Arc::new(Engine::new(
        config.schedule.clone(),
        cache.clone(),
        bus,
        store.clone(),
        store.clone(),
    ));
    let server = Arc::new(Server::new(
        engine.clone(),
        store,
        config.debounce,
        config.look_ahead_days,
    ));

    tokio::spawn(sweeper::run_sweeper(cache, config.sweep_interval));
    tokio::spawn(sweeper::run_preloader(
        engine,
        PreloadPlan {
            services: config.preload_services.clone(),
            duration_minutes: config.preload_duration_minutes,
            look_ahead_days: config.look_ahead_days,
            every: config.preload_interval,
        },
    ));

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    let hours = &config.schedule.default_hours;
    info!("availd listening on {addr}");
    info!("  business hours: {}-{}", hours.open.format("%H:%M"), hours.close.format("%H:%M"));
    info!("  slot granularity: {} min", config.schedule.granularity_minutes);
    info!("  cache ttl: {}s", config.cache_ttl.as_secs());
    info!("  max_connections: {max_connections}");
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler ({e}), waiting for ctrl-c only");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(availd::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(availd::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(availd::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let server = server.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, server).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(availd::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("availd stopped");
    Ok(())
}
