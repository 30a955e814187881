//! Market-data fan-out server entry point.
//!
//! Wires the upstream pool, dispatcher, quote cache, delivery engine, and
//! the WebSocket server together and runs until interrupted.

use std::env;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use common::{InstrumentCatalogue, QuoteSink, ServerConfig};
use dispatch::{QuoteCache, QuoteListener, SubscriptionDispatcher};
use gateway::{create_router, AppState, DiffDeliveryEngine, SessionRegistry};
use persistence::QuoteStore;
use upstream::driver::sim::SimFeedFactory;
use upstream::{ConnectionPool, DispatcherEvents, DriverFactory};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting market data server");

    let config = match env::args().nth(1).or_else(|| env::var("CONFIG_FILE").ok()) {
        Some(path) => {
            info!("loading configuration from {path}");
            ServerConfig::load_from_file(&path)?
        }
        None => {
            info!("no config file given, using defaults");
            ServerConfig::default()
        }
    };

    info!("Configuration:");
    info!("  websocket_port: {}", config.websocket_port);
    info!("  redis: {}:{}", config.redis_host, config.redis_port);
    info!("  strategy: {:?}", config.load_balance_strategy);
    info!("  connections: {} configured", config.connections.len());
    for conn in config.enabled_connections() {
        info!(
            "    [{}] {} (priority: {}, max_subs: {})",
            conn.connection_id, conn.front_addr, conn.priority, conn.max_subscriptions
        );
    }

    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9093".to_string())
        .parse()?;
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()?;
    info!("Prometheus exporter listening on port {metrics_port}");

    let catalogue = Arc::new(InstrumentCatalogue::new());
    if let Ok(seed_file) = env::var("INSTRUMENT_SEED_FILE") {
        match catalogue.load_seed_file(&seed_file) {
            Ok(count) => info!("loaded {count} instruments from {seed_file}"),
            Err(e) => warn!("failed to load instrument seed file {seed_file}: {e}"),
        }
    }

    // Persistence is best-effort: the server keeps serving without it.
    let sink: Option<Arc<dyn QuoteSink>> = match QuoteStore::spawn(&config.redis_url()) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("Redis unavailable ({e}); quotes will not be persisted");
            None
        }
    };

    let cache = Arc::new(QuoteCache::new());
    let dispatcher = Arc::new(SubscriptionDispatcher::new(
        Arc::clone(&cache),
        config.load_balance_strategy,
        config.max_retry_count,
        config.auto_failover,
        Duration::from_secs(config.maintenance_interval),
    ));

    let dispatcher_dyn: Arc<dyn DispatcherEvents> = dispatcher.clone();
    let events: Weak<dyn DispatcherEvents> = Arc::downgrade(&dispatcher_dyn);
    let factory: Arc<dyn DriverFactory> = Arc::new(SimFeedFactory::default());
    let pool = Arc::new(ConnectionPool::new(
        factory,
        events,
        Arc::clone(&catalogue),
        sink,
        Duration::from_secs(config.health_check_interval),
    ));
    dispatcher.attach_pool(Arc::clone(&pool));

    for conn in config.enabled_connections() {
        if !pool.add_connection(conn.clone()) {
            anyhow::bail!("failed to add connection {}", conn.connection_id);
        }
    }
    if pool.total_count() == 0 {
        anyhow::bail!("no enabled connections configured");
    }
    if !pool.start_all() {
        warn!("some upstream connections failed to start");
    }
    pool.start_health_monitor();
    dispatcher.start_maintenance();

    let registry = Arc::new(SessionRegistry::new());
    let engine = Arc::new(DiffDeliveryEngine::new(
        Arc::clone(&registry),
        Arc::clone(&cache),
        Arc::clone(&catalogue),
    ));
    let engine_dyn: Arc<dyn QuoteListener> = engine.clone();
    cache.set_listener(Arc::downgrade(&engine_dyn));

    let state = Arc::new(AppState {
        registry,
        engine,
        dispatcher: Arc::clone(&dispatcher),
        pool: Arc::clone(&pool),
        catalogue,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.websocket_port));
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket endpoint: ws://{addr}/ws");

    // Periodic status line, the ops-facing heartbeat.
    let status_pool = Arc::clone(&pool);
    let status_dispatcher = Arc::clone(&dispatcher);
    let status_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            info!(
                "status - active connections: {}, instruments: {}",
                status_pool.active_count(),
                status_dispatcher.total_subscriptions()
            );
            for line in status_pool.status_lines() {
                info!("  {line}");
            }
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    status_task.abort();
    dispatcher.stop_maintenance();
    pool.stop_all();
    info!("server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received terminate signal"),
    }
}
