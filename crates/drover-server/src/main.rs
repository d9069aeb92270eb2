//! # Drover Server
//!
//! Worker process that hosts the queues declared in configuration.
//!
//! Startup order:
//! 1. Layered configuration (`config/*.toml`, then `DROVER_*` variables)
//! 2. Tracing, with OTLP export when enabled
//! 3. Prometheus exporter, when enabled
//! 4. Store backend, wrapped in transient-error retries
//! 5. One queue per `[queues.<name>]` table, then the worker pools
//!
//! SIGINT or SIGTERM stops intake and drains running handlers for up to
//! `manager.drain_timeout_secs`.

use drover_config::{AppConfig, ConfigLoader, MetricsConfig, StoreBackend};
use drover_core::{init_telemetry, shutdown_telemetry, DroverError, DroverResult};
use drover_queue::{
    create_pool, register_metrics, JobStore, MemoryJobStore, QueueConfig, QueueManager,
    RedisJobStore, RetryingStore,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod handler;

use handler::LoggingHandler;

#[tokio::main]
async fn main() {
    let config = match ConfigLoader::from_default_location() {
        Ok(loader) => loader.get().await,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_telemetry(&config.telemetry) {
        eprintln!("Failed to initialize telemetry: {}", e);
        std::process::exit(1);
    }

    info!("Starting Drover Server...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.environment);

    let result = run(config).await;
    shutdown_telemetry();

    if let Err(e) = result {
        error!(code = e.error_code(), "Application error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> DroverResult<()> {
    if config.metrics.enabled {
        install_metrics_exporter(&config.metrics)?;
    }

    let store = build_store(&config).await?;
    let manager = Arc::new(QueueManager::new(store));

    if config.queues.is_empty() {
        warn!("No queues configured; the server will idle until shutdown");
    }
    for (name, settings) in &config.queues {
        let queue_config = QueueConfig::from(settings);
        info!(
            queue = %name,
            concurrency = queue_config.concurrency,
            priority_levels = queue_config.priority_levels,
            max_attempts = queue_config.retry.max_attempts,
            "Registering queue"
        );
        manager.register_queue(name.as_str(), queue_config, LoggingHandler)?;
    }

    manager.start().await?;
    info!(queues = ?manager.queue_names(), "Queue manager started");

    let reporter = config
        .manager
        .stats_interval()
        .map(|period| spawn_stats_reporter(Arc::clone(&manager), period));

    shutdown_signal().await;

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    let report = manager.stop(config.manager.drain_timeout()).await;
    if report.drained {
        info!(elapsed_ms = report.elapsed.as_millis() as u64, "Shutdown complete");
    } else {
        warn!(
            abandoned_slots = report.abandoned_slots,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Drain timeout elapsed; unfinished jobs stay in flight until their locks expire"
        );
    }

    Ok(())
}

/// Builds the configured store and wraps it in transient-error retries.
async fn build_store(config: &AppConfig) -> DroverResult<Arc<dyn JobStore>> {
    let budget = config.store.transient_retry_max_elapsed();

    let store: Arc<dyn JobStore> = match config.store.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; job state is lost on restart");
            Arc::new(RetryingStore::new(MemoryJobStore::new(), budget))
        }
        StoreBackend::Redis => {
            info!("Connecting to Redis at {}", config.redis.url);
            let pool = create_pool(&config.redis)
                .await
                .map_err(|e| DroverError::Store(e.to_string()))?;
            let redis = RedisJobStore::new(pool, config.store.key_prefix.clone());
            Arc::new(RetryingStore::new(redis, budget))
        }
    };

    info!(backend = %config.store.backend, "Store ready");
    Ok(store)
}

/// Installs the Prometheus scrape endpoint and describes the queue metrics.
fn install_metrics_exporter(config: &MetricsConfig) -> DroverResult<()> {
    let addr: SocketAddr = config.listen_addr.parse().map_err(|_| {
        DroverError::configuration(format!("Invalid metrics listen address: {}", config.listen_addr))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| DroverError::Telemetry(format!("Failed to install Prometheus exporter: {}", e)))?;

    register_metrics();
    info!("Prometheus metrics available at http://{}/metrics", addr);
    Ok(())
}

/// Logs a stats snapshot for every queue each `period`.
fn spawn_stats_reporter(manager: Arc<QueueManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match manager.all_stats().await {
                Ok(all) => {
                    for stats in all {
                        info!(
                            queue = %stats.queue,
                            ready = stats.ready,
                            delayed = stats.delayed,
                            in_flight = stats.in_flight,
                            dead_lettered = stats.dead_lettered,
                            concurrency = stats.concurrency,
                            completed_total = stats.completed_total,
                            retried_total = stats.retried_total,
                            failed_total = stats.failed_total,
                            "Queue stats"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Failed to collect queue stats"),
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
