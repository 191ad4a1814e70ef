use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uploads_service::admin::AdminService;
use uploads_service::api::{start_api_server, AppState};
use uploads_service::catalog::{Catalog, PgCatalog};
use uploads_service::config::Config;
use uploads_service::content_store::ContentStore;
use uploads_service::events::{EventHandler, UploadsEventConsumer};
use uploads_service::files::Bucket;
use uploads_service::lifecycle::LifecycleManager;
use uploads_service::moderation::KafkaBanNotifier;
use uploads_service::object_store::{ObjectStore, S3ObjectStore};
use uploads_service::purge::CachePurger;
use uploads_service::regions::{Region, RegionRouter};
use uploads_service::tasks::BackgroundTasks;
use uploads_service::token::TokenVerifier;
use uploads_service::transcoder::ImageTranscoder;

/// How long shutdown waits for in-flight background work
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        regions = config.regions.len(),
        "Starting uploads service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Catalog
    let pg_catalog = PgCatalog::new(&config.database)
        .await
        .context("Failed to initialize catalog")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        pg_catalog
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }
    let catalog: Arc<dyn Catalog> = Arc::new(pg_catalog);

    // Object store regions, primary first
    let mut regions = Vec::with_capacity(config.regions.len());
    for region_config in &config.regions {
        let store = S3ObjectStore::new(region_config)
            .await
            .with_context(|| format!("Failed to initialize region {}", region_config.name))?;
        regions.push(Region::new(region_config.name.clone(), Arc::new(store)));
    }
    let router = RegionRouter::new(regions, config.storage.operation_timeout())
        .context("Failed to initialize region router")?;
    ensure_buckets(router.primary(), &config).await?;

    let tasks = BackgroundTasks::new();
    let notifier = Arc::new(
        KafkaBanNotifier::new(&config.events).context("Failed to initialize ban notifier")?,
    );

    let store = Arc::new(ContentStore::new(
        catalog.clone(),
        router,
        Arc::new(ImageTranscoder::new()),
        notifier,
        tasks.clone(),
        &config.storage,
        config.limits.clone(),
    ));

    let shutdown = CancellationToken::new();

    // Garbage collection
    let lifecycle = LifecycleManager::new(catalog.clone(), store.clone(), &config.lifecycle);
    let (lifecycle_handle, lifecycle_triggers) = LifecycleManager::handle();

    // Create Kafka consumer
    let consumer = UploadsEventConsumer::new(
        &config.events,
        EventHandler::new(store.clone(), lifecycle_handle),
    )
    .context("Failed to initialize Kafka consumer")?;

    let purger = match &config.cache_purge {
        Some(purge_config) => Some(Arc::new(
            CachePurger::new(purge_config).context("Failed to initialize cache purger")?,
        )),
        None => {
            warn!("Cache purge not configured, deleted files stay cached at the edge");
            None
        }
    };

    // Create API state
    let api_state = AppState {
        store: store.clone(),
        verifier: Arc::new(TokenVerifier::new(&config.auth.token_secret)),
        admin: Arc::new(AdminService::new(store.clone(), purger, tasks.clone())),
        internal_token: Arc::from(config.auth.internal_token.as_str()),
    };

    // Spawn Kafka consumer task
    let consumer_shutdown = shutdown.clone();
    let consumer_handle = tokio::spawn(async move {
        consumer.run(consumer_shutdown).await;
    });

    // Spawn GC task
    let gc_handle = tokio::spawn(lifecycle.run(lifecycle_triggers, shutdown.clone()));

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Uploads service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down uploads service");

    shutdown.cancel();
    api_handle.abort();
    for (name, handle) in [("consumer", consumer_handle), ("lifecycle", gc_handle)] {
        if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
            warn!(task = name, "Task did not stop in time");
        }
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, tasks.drain()).await.is_err() {
        warn!(pending = tasks.pending(), "Abandoning unfinished background tasks");
        tasks.abort_all();
    }

    info!("Uploads service stopped");

    Ok(())
}

/// Create the logical buckets on the primary region
async fn ensure_buckets(primary: &Region, config: &Config) -> Result<()> {
    let buckets = Bucket::ALL
        .iter()
        .map(|bucket| bucket.as_str())
        .chain([
            config.storage.previews_bucket.as_str(),
            config.storage.data_exports_bucket.as_str(),
        ]);

    for bucket in buckets {
        primary
            .store
            .ensure_bucket(bucket)
            .await
            .with_context(|| format!("Failed to ensure bucket {} in {}", bucket, primary.name))?;
    }
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
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
