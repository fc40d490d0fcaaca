// src/http/mod.rs

pub mod handlers;
pub mod models;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::analytics::{AnalyticsService, HitTracker};
use crate::auth::middleware::{ingest_auth, query_auth};
use crate::auth::{ApiKeyCipher, JwtService};
use crate::config::AppConfig;
use crate::events::EventFanout;
use crate::ingest::IngestPipeline;
use crate::kv::KvGateway;
use crate::limiter::RateLimiter;
use crate::storage::{ActivityLog, CallerRegistry};

/// Long-lived singletons, wired once at startup and handed to every
/// handler. Trait objects keep the backends swappable in tests.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub kv: Arc<dyn KvGateway>,
    pub callers: Arc<dyn CallerRegistry>,
    pub activity: Arc<dyn ActivityLog>,
    pub pipeline: Arc<IngestPipeline>,
    pub limiter: Arc<RateLimiter>,
    pub analytics: Arc<AnalyticsService>,
    pub hits: Arc<HitTracker>,
    pub events: Arc<EventFanout>,
    pub jwt: Arc<JwtService>,
    pub cipher: Arc<ApiKeyCipher>,
}

/// Assemble the /api router
pub fn create_router(state: AppState) -> Router {
    let ingest_routes = Router::new()
        .route("/logs", post(handlers::ingest_log))
        .route_layer(from_fn_with_state(state.clone(), ingest_auth));

    let query_routes = Router::new()
        .route("/usage/daily", get(handlers::usage_daily))
        .route("/usage/top", get(handlers::usage_top))
        .route_layer(from_fn_with_state(state.clone(), query_auth));

    let open_routes = Router::new()
        .route("/register", post(handlers::register))
        .route("/usage/stream", get(handlers::stream))
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api", ingest_routes.merge(query_routes).merge(open_routes))
        .with_state(state)
}
