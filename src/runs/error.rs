use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::runs::domain::RunStatus;
use crate::runs::persistence::StoreError;

/// Errors returned synchronously by the run operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// `resume` was called for a run this process holds no context for.
    #[error("No resumable context for run '{0}'")]
    RunContextMissing(String),

    /// The run exists but is not paused waiting for decisions.
    #[error("Run '{run_id}' is {status}, not awaiting approval")]
    NotResumable { run_id: String, status: RunStatus },

    #[error("Run '{0}' not found")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RunContextMissing(_) => "RunContextMissing",
            Self::NotResumable { .. } => "RunNotResumable",
            Self::NotFound(_) => "NotFound",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Store(_) => "StoreUnavailable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RunContextMissing(_) | Self::NotResumable { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Run operation failed");
        }
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_statuses() {
        let missing = OrchestratorError::RunContextMissing("r1".into());
        assert_eq!(missing.code(), "RunContextMissing");
        assert_eq!(missing.status_code(), StatusCode::CONFLICT);

        let busy = OrchestratorError::NotResumable {
            run_id: "r1".into(),
            status: RunStatus::Running,
        };
        assert_eq!(busy.code(), "RunNotResumable");
        assert_eq!(busy.status_code(), StatusCode::CONFLICT);
        assert_eq!(busy.to_string(), "Run 'r1' is running, not awaiting approval");

        let store = OrchestratorError::from(StoreError::Backend("down".into()));
        assert_eq!(store.code(), "StoreUnavailable");
        assert_eq!(store.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
