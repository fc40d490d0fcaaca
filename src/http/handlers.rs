// src/http/handlers.rs

use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::auth::keys::{
    generate_api_key, hash_api_key, lookup_digest, mint_caller_id,
};
use crate::auth::middleware::{resolve_api_key, resolve_bearer, AuthContext};
use crate::error::{ApiError, Result};
use crate::events::sse::{live_stream, StreamChannel};
use crate::http::models::{
    DailyQuery, HealthResponse, LogRequest, RegisterRequest, RegisterResponse, ServiceResponse,
    StreamQuery, TopQuery, UsageData,
};
use crate::http::AppState;
use crate::storage::{ActivityRecord, NewCaller};

/// POST /api/register
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::Validation("name must not be empty".to_string()));
    }
    let email = request.email.trim().to_lowercase();
    if !email.contains('@') || email.len() < 3 {
        return Err(ApiError::Validation("email is invalid".to_string()));
    }
    let rate_limit = match request.rate_limit {
        Some(0) => return Err(ApiError::Validation("rate_limit must be positive".to_string())),
        Some(limit) => limit as i32,
        None => state.config.rate_limit.default_ceiling as i32,
    };

    // The raw key exists only in this scope and in the response body
    let api_key = generate_api_key();
    let caller = state
        .callers
        .create(NewCaller {
            id: mint_caller_id(),
            name: name.to_string(),
            email,
            rate_limit,
            credential_id: Uuid::new_v4(),
            key_digest: lookup_digest(&api_key),
            key_hash: hash_api_key(&api_key)?,
            key_enc: state.cipher.encrypt(&api_key)?,
        })
        .await?;

    let token = state.jwt.issue(&caller)?;

    Ok(ServiceResponse::created(
        "Caller registered",
        RegisterResponse {
            caller_id: caller.id,
            name: caller.name,
            email: caller.email,
            api_key,
            token,
            rate_limit: caller.rate_limit,
            created_at: caller.created_at,
        },
    ))
}

/// POST /api/logs
pub async fn ingest_log(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(request): Json<LogRequest>,
) -> Result<impl IntoResponse> {
    if request.endpoint.trim().is_empty() {
        return Err(ApiError::Validation("endpoint must not be empty".to_string()));
    }
    if request.method.trim().is_empty() {
        return Err(ApiError::Validation("method must not be empty".to_string()));
    }
    if !(100..=599).contains(&request.status) {
        return Err(ApiError::Validation(
            "status must be a valid HTTP status".to_string(),
        ));
    }

    let record = ActivityRecord {
        caller_id: context.caller.id.clone(),
        credential_id: context.credential_id,
        endpoint: request.endpoint.trim().to_string(),
        method: request.method.trim().to_uppercase(),
        status: request.status,
        elapsed_ms: request.elapsed_ms.unwrap_or(0).max(0),
        ip: request.ip,
        user_agent: request.ua,
        timestamp: Utc::now(),
    };

    // Enqueue, then fan out; neither waits on storage
    state.events.publish(&record);
    state.pipeline.submit(record);

    Ok(ServiceResponse::created("Log accepted", json!(null)))
}

/// GET /api/usage/daily?days=N
pub async fn usage_daily(
    State(state): State<AppState>,
    Query(query): Query<DailyQuery>,
) -> Result<impl IntoResponse> {
    let days = query.days.unwrap_or(7);
    if days == 0 || days > 365 {
        return Err(ApiError::Validation(
            "days must be between 1 and 365".to_string(),
        ));
    }

    let data = state.analytics.daily_usage(days).await?;
    Ok(ServiceResponse::ok("Daily usage", UsageData { data }))
}

/// GET /api/usage/top?hours=H&limit=L
pub async fn usage_top(
    State(state): State<AppState>,
    Query(query): Query<TopQuery>,
) -> Result<impl IntoResponse> {
    let hours = query.hours.unwrap_or(24);
    let limit = query.limit.unwrap_or(3);
    if hours == 0 || hours > 24 * 365 {
        return Err(ApiError::Validation(
            "hours must be between 1 and 8760".to_string(),
        ));
    }
    if limit == 0 || limit > 100 {
        return Err(ApiError::Validation(
            "limit must be between 1 and 100".to_string(),
        ));
    }

    let data = state.analytics.top_callers(hours, limit).await?;
    Ok(ServiceResponse::ok("Top callers", UsageData { data }))
}

/// GET /api/usage/stream?token=...|apiKey=...&channel=...
///
/// SSE cannot carry headers, so credentials arrive as query parameters.
pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let context = if let Some(token) = query.token.as_deref() {
        resolve_bearer(&state, token).await
    } else if let Some(key) = query.api_key.as_deref() {
        resolve_api_key(&state, key).await
    } else {
        Err(ApiError::Unauthenticated("missing credentials".to_string()))
    };

    let context = match context {
        Ok(context) => context,
        Err(e) => return e.into_response(),
    };

    let channel = StreamChannel::parse(query.channel.as_deref());
    live_stream(
        state.analytics.clone(),
        state.events.hub().clone(),
        &context.caller,
        channel,
    )
    .into_response()
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let kv_ready = state.kv.get("health:probe").await.is_ok();
    let database_ready = state.callers.find_by_id("CL-000000000000").await.is_ok();

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            kv_ready,
            database_ready,
        }),
    )
}
