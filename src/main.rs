use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time;
use tracing::{error, info, warn};

use nexmedis_api::analytics::{AnalyticsService, HitTracker, Prewarmer};
use nexmedis_api::auth::{ApiKeyCipher, JwtService};
use nexmedis_api::config::AppConfig;
use nexmedis_api::error::ApiError;
use nexmedis_api::events::{EventFanout, SubscriberHub};
use nexmedis_api::http::{create_router, AppState};
use nexmedis_api::ingest::{IngestPipeline, OverflowBuffer};
use nexmedis_api::init_logging;
use nexmedis_api::kv::{KvGateway, RedisKv};
use nexmedis_api::limiter::RateLimiter;
use nexmedis_api::storage::{
    postgres, ActivityLog, CallerRegistry, PgActivityLog, PgCallerRegistry,
};

/// Hard ceiling on the whole shutdown sequence
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Retention sweeps run daily
const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 3600);

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();
    info!("nexmedis-api starting up");

    if let Err(e) = run().await {
        error!(error = %e, "startup failed");
        std::process::exit(1);
    }
}

async fn run() -> nexmedis_api::Result<()> {
    let config = Arc::new(AppConfig::from_env()?);

    // Shared stores first; nothing else can come up without them
    let redis = Arc::new(RedisKv::connect(config.redis.clone()).await?);
    let kv: Arc<dyn KvGateway> = redis.clone();

    let (pool, read_pool) = postgres::connect(&config.database).await?;
    let callers: Arc<dyn CallerRegistry> =
        Arc::new(PgCallerRegistry::new(pool.clone(), read_pool.clone()));
    let activity: Arc<dyn ActivityLog> = Arc::new(PgActivityLog::new(pool.clone(), read_pool));

    // Ingestion
    let buffer = Arc::new(OverflowBuffer::new(
        config.ingest.overflow_max_size,
        config.ingest.overflow_max_age,
    ));
    buffer.start_cleanup(config.ingest.overflow_cleanup_interval);

    let pipeline = Arc::new(IngestPipeline::new(
        Arc::clone(&activity),
        Arc::clone(&buffer),
        config.ingest.clone(),
    ));
    pipeline.start_timer();

    // Rate limiting
    let limiter = Arc::new(RateLimiter::new(Arc::clone(&kv), config.rate_limit.clone()));
    limiter.start_sweep();

    // Analytics
    let hits = Arc::new(HitTracker::new(
        Arc::clone(&kv),
        config.cache.hit_tracking_enabled,
        config.cache.prewarm_threshold,
    ));
    let analytics = Arc::new(AnalyticsService::new(
        Arc::clone(&kv),
        Arc::clone(&activity),
        Arc::clone(&callers),
        Arc::clone(&hits),
        config.cache.clone(),
    ));

    let prewarmer = Arc::new(Prewarmer::new(
        Arc::clone(&analytics),
        Arc::clone(&hits),
        config.prewarm.clone(),
    ));
    prewarmer.run_startup().await;
    prewarmer.start();

    // Event fan-out
    let hub = Arc::new(SubscriberHub::new());
    let events = Arc::new(EventFanout::new(Arc::clone(&kv), Arc::clone(&hub)));
    if let Err(e) = events.start_consumer().await {
        // Live subscribers degrade; ingestion and analytics still work
        warn!(error = %e, "event consumer not started");
    }

    // Retention sweep
    spawn_retention_sweep(Arc::clone(&activity), config.database.retention_days);

    // Credentials
    let jwt = Arc::new(JwtService::new(&config.auth.jwt_secret, config.auth.token_ttl)?);
    let cipher = Arc::new(ApiKeyCipher::from_hex_key(&config.auth.encryption_key)?);

    let state = AppState {
        config: Arc::clone(&config),
        kv: Arc::clone(&kv),
        callers,
        activity,
        pipeline: Arc::clone(&pipeline),
        limiter: Arc::clone(&limiter),
        analytics,
        hits,
        events,
        jwt,
        cipher,
    };

    let app = create_router(state);
    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| ApiError::Config(format!("cannot bind {}: {}", address, e)))?;
    info!(%address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("server: {}", e)))?;

    // Ordered teardown: timers first, then the write path, then the
    // connections it was writing to
    let shutdown = async {
        prewarmer.stop();
        hub.close();
        pipeline.shutdown().await;
        limiter.stop_sweep();
        redis.stop_probe();
        pool.close().await;
    };

    if time::timeout(SHUTDOWN_DEADLINE, shutdown).await.is_err() {
        error!("shutdown deadline exceeded, forcing exit");
        std::process::exit(1);
    }

    info!("clean shutdown");
    Ok(())
}

fn spawn_retention_sweep(activity: Arc<dyn ActivityLog>, retention_days: u32) {
    tokio::spawn(async move {
        let mut timer = time::interval_at(
            time::Instant::now() + RETENTION_INTERVAL,
            RETENTION_INTERVAL,
        );
        loop {
            timer.tick().await;
            match activity.delete_older_than(retention_days).await {
                Ok(removed) if removed > 0 => info!(removed, "retention sweep"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "retention sweep failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "signal listener failed");
    }
    info!("shutdown signal received");
}
