use anyhow::{Context, Result};
use emote_pipeline::{AmqpBroker, Broker};
use emote_service::config::Config;
use emote_service::{
    start_api_server, AppState, Authenticator, CommandProbe, EmoteStore, JobDispatcher,
    MemoryEmoteStore, MemoryStatusCache, PgEmoteStore, Reconciler, RedisStatusCache, S3Stager,
    StatusCache, UploadValidator,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Emote Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store: Arc<dyn EmoteStore> = match &config.database {
        Some(database) => {
            let store = PgEmoteStore::new(database)
                .await
                .context("Failed to initialize emote store")?;

            // Run migrations if enabled
            if database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }
            Arc::new(store)
        }
        None => {
            warn!("No database configured, emote records are kept in memory");
            Arc::new(MemoryEmoteStore::new())
        }
    };

    let cache: Arc<dyn StatusCache> = match &config.redis {
        Some(redis) => Arc::new(
            RedisStatusCache::connect(&redis.url)
                .await
                .context("Failed to connect to redis")?,
        ),
        None => Arc::new(MemoryStatusCache::new()),
    };

    let stager = Arc::new(
        S3Stager::new(&config.s3)
            .await
            .context("Failed to initialize S3 stager")?,
    );

    let probe = Arc::new(CommandProbe::new(
        config.upload.ffprobe_path.clone(),
        config.upload.webpmux_path.clone(),
    ));
    let validator = Arc::new(UploadValidator::new(config.upload.clone(), probe));

    // Without a broker uploads are refused and nothing is reconciled
    let broker: Option<Arc<AmqpBroker>> = match &config.amqp {
        Some(amqp) => Some(Arc::new(
            AmqpBroker::connect(amqp.clone())
                .await
                .context("Failed to connect to AMQP broker")?,
        )),
        None => {
            warn!("No AMQP broker configured, uploads will be refused");
            None
        }
    };

    let cancel = CancellationToken::new();

    let reconciler = match (&broker, &config.amqp) {
        (Some(broker), Some(amqp)) => Some(
            Reconciler::new(
                broker.clone(),
                amqp.queues.clone(),
                store.clone(),
                cache.clone(),
                config.status_ttl(),
            )
            .spawn(cancel.clone())
            .await
            .context("Failed to start reconciler")?,
        ),
        _ => None,
    };

    let dispatcher = match (&broker, &config.amqp) {
        (Some(broker), Some(amqp)) => Some(JobDispatcher::new(
            broker.clone(),
            amqp.queues.job.clone(),
            config.s3.public_bucket.clone(),
        )),
        _ => None,
    };

    // Create API state
    let api_state = AppState {
        store,
        cache,
        validator,
        stager,
        dispatcher,
        authenticator: Arc::new(Authenticator::new(&config.auth.jwt_secret)),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_cancel = cancel.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_cancel).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Emote service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down emote service");
    cancel.cancel();

    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task panicked");
    }
    if let Some(reconciler) = reconciler {
        reconciler.join().await;
    }
    if let Some(broker) = broker {
        if let Err(e) = broker.shutdown().await {
            warn!(error = %e, "Failed to close AMQP connection");
        }
    }

    info!("Emote service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
