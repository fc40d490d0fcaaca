// src/auth/middleware.rs

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::auth::keys::{lookup_digest, verify_api_key};
use crate::error::{ApiError, Result};
use crate::http::AppState;
use crate::limiter::RateLimitDecision;
use crate::storage::Caller;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Identity resolved by the auth layer, available to handlers via
/// request extensions
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub caller: Caller,
    /// Set when the request authenticated with an API key
    pub credential_id: Option<Uuid>,
}

/// Middleware for the ingestion path: API key only, then rate limit
pub async fn ingest_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let context = match api_key_context(&state, request.headers()).await {
        Ok(context) => context,
        Err(e) => return e.into_response(),
    };

    guard_and_forward(state, context, request, next).await
}

/// Middleware for the analytics paths: bearer token or API key, then
/// rate limit
pub async fn query_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let headers = request.headers();
    let context = if let Some(token) = bearer_token(headers) {
        resolve_bearer(&state, &token).await
    } else {
        api_key_context(&state, headers).await
    };

    let context = match context {
        Ok(context) => context,
        Err(e) => return e.into_response(),
    };

    guard_and_forward(state, context, request, next).await
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn api_key_context(state: &AppState, headers: &HeaderMap) -> Result<AuthContext> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::Unauthenticated("missing credentials".to_string()))?;

    resolve_api_key(state, key).await
}

/// Resolve an API key to its caller.
///
/// Lookup goes through the SHA-256 digest index; the bcrypt comparison
/// then confirms the key against the stored hash. Auth fails closed on
/// storage errors.
pub async fn resolve_api_key(state: &AppState, key: &str) -> Result<AuthContext> {
    let digest = lookup_digest(key);
    let (caller, credential) = state
        .callers
        .find_by_key_digest(&digest)
        .await?
        .ok_or_else(|| ApiError::Unauthenticated("unknown API key".to_string()))?;

    if !verify_api_key(key, &credential.key_hash) {
        return Err(ApiError::Unauthenticated("invalid API key".to_string()));
    }
    if !caller.is_active {
        return Err(ApiError::Forbidden("caller is deactivated".to_string()));
    }

    touch_last_seen(state, &caller.id);
    Ok(AuthContext {
        caller,
        credential_id: Some(credential.id),
    })
}

/// Resolve a bearer token to its caller
pub async fn resolve_bearer(state: &AppState, token: &str) -> Result<AuthContext> {
    let claims = state.jwt.verify(token)?;
    let caller = state
        .callers
        .find_by_id(&claims.sub)
        .await?
        .ok_or_else(|| ApiError::Unauthenticated("unknown caller".to_string()))?;

    if !caller.is_active {
        return Err(ApiError::Forbidden("caller is deactivated".to_string()));
    }

    touch_last_seen(state, &caller.id);
    Ok(AuthContext {
        caller,
        credential_id: None,
    })
}

// Fire-and-forget last-seen update
fn touch_last_seen(state: &AppState, caller_id: &str) {
    let registry = Arc::clone(&state.callers);
    let caller_id = caller_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = registry.touch_last_seen(&caller_id).await {
            debug!(%caller_id, error = %e, "last-seen update failed");
        }
    });
}

async fn guard_and_forward(
    state: AppState,
    context: AuthContext,
    mut request: Request,
    next: Next,
) -> Response {
    let ceiling = context.caller.rate_limit.max(0) as u64;
    let decision = state.limiter.check(&context.caller.id, Some(ceiling)).await;
    let window = state.config.rate_limit.window;

    if !decision.allowed {
        let err = ApiError::RateLimited {
            caller_id: context.caller.id.clone(),
            retry_after: decision.retry_after_secs(Utc::now()),
        };
        let mut response = err.into_response();
        apply_limit_headers(response.headers_mut(), &decision, window);
        return response;
    }

    request.extensions_mut().insert(context);
    let mut response = next.run(request).await;
    apply_limit_headers(response.headers_mut(), &decision, window);
    response
}

/// Attach the rate-limit headers every limited response carries
pub fn apply_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision, window: Duration) {
    insert_header(headers, "x-ratelimit-limit", decision.limit.to_string());
    insert_header(headers, "x-ratelimit-remaining", decision.remaining.to_string());
    insert_header(headers, "x-ratelimit-reset", decision.reset_at.to_rfc3339());
    insert_header(headers, "x-ratelimit-window", format!("{}s", window.as_secs()));
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(name, value);
    }
}
