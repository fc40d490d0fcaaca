// src/http/models.rs

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::error::ApiError;

/// Envelope every JSON endpoint answers with
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub response_object: Option<T>,
    pub status_code: u16,
}

impl<T: Serialize> ServiceResponse<T> {
    pub fn ok(message: impl Into<String>, object: T) -> (StatusCode, Json<Self>) {
        Self::with_status(StatusCode::OK, message, object)
    }

    pub fn created(message: impl Into<String>, object: T) -> (StatusCode, Json<Self>) {
        Self::with_status(StatusCode::CREATED, message, object)
    }

    fn with_status(
        status: StatusCode,
        message: impl Into<String>,
        object: T,
    ) -> (StatusCode, Json<Self>) {
        (
            status,
            Json(Self {
                success: true,
                message: message.into(),
                response_object: Some(object),
                status_code: status.as_u16(),
            }),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let status =
            StatusCode::from_u16(status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        // Full detail stays in the logs; 5xx bodies say nothing useful
        let message = match &self {
            ApiError::Storage(_) | ApiError::Internal(_) | ApiError::Config(_) => {
                error!(error = %self, "request failed");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let response_object = match &self {
            ApiError::RateLimited { .. } => json!({"error": {"code": "RATE_LIMIT_EXCEEDED"}}),
            _ => serde_json::Value::Null,
        };

        let body = json!({
            "success": false,
            "message": message,
            "responseObject": response_object,
            "statusCode": status_code,
        });

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after, .. } = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub rate_limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub caller_id: String,
    pub name: String,
    pub email: String,
    /// Shown exactly once; only hashes survive server-side
    pub api_key: String,
    pub token: String,
    pub rate_limit: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct LogRequest {
    pub endpoint: String,
    pub method: String,
    pub status: i16,
    pub elapsed_ms: Option<i32>,
    pub ip: Option<String>,
    pub ua: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DailyQuery {
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    pub hours: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub token: Option<String>,
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    pub channel: Option<String>,
}

/// Wrapper matching the documented `{data: [...]}` shape
#[derive(Debug, Serialize)]
pub struct UsageData<T: Serialize> {
    pub data: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub kv_ready: bool,
    pub database_ready: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_camel_case_keys() {
        let (_, Json(body)) = ServiceResponse::ok("done", json!({"x": 1}));
        let rendered = serde_json::to_value(&body).unwrap();

        assert_eq!(rendered["success"], json!(true));
        assert_eq!(rendered["message"], json!("done"));
        assert_eq!(rendered["responseObject"], json!({"x": 1}));
        assert_eq!(rendered["statusCode"], json!(200));
    }

    #[test]
    fn created_envelope_carries_201() {
        let (status, Json(body)) = ServiceResponse::created("made", json!(null));
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body.status_code, 201);
    }

    #[tokio::test]
    async fn rate_limited_response_has_retry_after_and_code() {
        let response = ApiError::RateLimited {
            caller_id: "CL-1".into(),
            retry_after: 3600,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "3600"
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            body["responseObject"]["error"]["code"],
            json!("RATE_LIMIT_EXCEEDED")
        );
        assert_eq!(body["success"], json!(false));
    }

    #[tokio::test]
    async fn internal_errors_hide_detail() {
        let response = ApiError::Internal("secret detail".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["message"], json!("Internal server error"));
    }
}
