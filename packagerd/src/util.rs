//! Shared ingress plumbing: application state, the shared-secret check,
//! and the JSON envelope the endpoint table describes.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use packager_common::error::PackageError;
use packager_common::pool::WorkerPool;
use packager_common::prelude::*;
use packager_common::stats::StatsStore;
use packager_common::task::TaskEnv;

/// Shared state handed to every ingress handler.
#[derive(Clone)]
pub struct AppState {
    pub secret: Arc<String>,
    pub stats: Arc<StatsStore>,
    pub fast_pool: Arc<WorkerPool>,
    pub slow_pool: Arc<WorkerPool>,
    pub env: TaskEnv,
}

/// Check a form-supplied secret against the configured one.
pub fn check_secret(state: &AppState, secret: Option<&str>) -> IngressResult<()> {
    match secret {
        Some(s) if s == state.secret.as_str() => Ok(()),
        _ => Err(IngressError::from(PackageError::NotAuthorized)),
    }
}

/// An ingress-level error, mapped to the `{status:"failed", error,
/// message}` envelope and the matching HTTP status code from spec §6.
pub struct IngressError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl From<PackageError> for IngressError {
    fn from(e: PackageError) -> Self {
        let status = match &e {
            PackageError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PackageError::NotAuthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        IngressError {
            status,
            error: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<Error> for IngressError {
    fn from(e: Error) -> Self {
        match e.downcast::<PackageError>() {
            Ok(package_error) => package_error.into(),
            Err(e) => IngressError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                error: "InternalError",
                message: format!("{e:#}"),
            },
        }
    }
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        error!(error = %self.message, code = self.error, "ingress request failed");
        (
            self.status,
            Json(serde_json::json!({
                "status": "failed",
                "error": self.error,
                "message": self.message,
            })),
        )
            .into_response()
    }
}

/// The result type every ingress handler returns.
pub type IngressResult<T> = std::result::Result<T, IngressError>;

/// Build the `{status:"success", ...}` envelope, flattening `body` into
/// it so existing field names (e.g. `worker_count`) stay top-level.
pub fn success(body: impl Serialize) -> Json<serde_json::Value> {
    let mut value = serde_json::to_value(body).unwrap_or(serde_json::Value::Null);
    if let serde_json::Value::Object(map) = &mut value {
        map.insert("status".to_owned(), serde_json::Value::String("success".to_owned()));
    }
    Json(value)
}
