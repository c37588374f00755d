//! Error types for the HTTP surface.
//!
//! [`ApiError`] unifies every failure a handler can hit and converts into an
//! Axum response via its [`IntoResponse`](axum::response::IntoResponse)
//! implementation. Fast-path failures keep their wire outcome body
//! (`cooldown`, `busy`, `failed`); everything else answers with
//! `{"error", "status"}`. A failure whose retry policy names a delay also
//! sets `Retry-After` in whole seconds.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use pixelwar_core::error::{PaintError, RetryPolicy, StoreError, whole_seconds_ceil};
use pixelwar_types::PaintOutcome;

/// Errors that can occur in the API layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// An invalid query parameter was provided.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The fast path rejected or failed a write.
    #[error(transparent)]
    Paint(#[from] PaintError),

    /// A backing store failed while serving a read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    /// HTTP status this error answers with.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidQuery(_) | Self::Paint(PaintError::Validation(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Paint(PaintError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
            Self::Paint(PaintError::Contention { .. }) => StatusCode::CONFLICT,
            Self::Paint(PaintError::Infra(_)) | Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Status code paired with a write outcome.
pub const fn outcome_status(outcome: PaintOutcome) -> StatusCode {
    match outcome {
        PaintOutcome::Ok => StatusCode::OK,
        PaintOutcome::Cooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
        PaintOutcome::Busy => StatusCode::CONFLICT,
        PaintOutcome::Failed => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Paint(paint) = &self
            && let Some(outcome) = paint.outcome()
        {
            let mut response = (outcome_status(outcome), Json(outcome)).into_response();
            if let RetryPolicy::RetryAfter(delay) = paint.retry_policy() {
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(whole_seconds_ceil(delay)),
                );
            }
            return response;
        }

        let status = self.status();
        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pixelwar_types::CellCoord;

    use super::*;

    #[test]
    fn paint_errors_map_to_wire_statuses() {
        let cooldown = ApiError::from(PaintError::RateLimited {
            remaining: Duration::from_millis(4200),
        });
        assert_eq!(cooldown.status(), StatusCode::TOO_MANY_REQUESTS);

        let busy = ApiError::from(PaintError::Contention {
            cell: CellCoord::new(1, 2),
        });
        assert_eq!(busy.status(), StatusCode::CONFLICT);

        let failed = ApiError::from(PaintError::Infra(StoreError::Unavailable(
            String::from("down"),
        )));
        assert_eq!(failed.status(), StatusCode::SERVICE_UNAVAILABLE);

        let invalid = ApiError::from(PaintError::Validation(String::from("color")));
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn write_outcomes_pair_with_statuses() {
        assert_eq!(outcome_status(PaintOutcome::Ok), StatusCode::OK);
        assert_eq!(outcome_status(PaintOutcome::Busy), StatusCode::CONFLICT);
        assert_eq!(
            outcome_status(PaintOutcome::Cooldown {
                remaining_seconds: 3
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    fn retry_after(error: ApiError) -> Option<String> {
        error
            .into_response()
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    #[test]
    fn cooldown_answers_with_retry_after() {
        let cooldown = ApiError::from(PaintError::RateLimited {
            remaining: Duration::from_millis(4200),
        });
        assert_eq!(retry_after(cooldown).as_deref(), Some("5"));

        let busy = ApiError::from(PaintError::Contention {
            cell: CellCoord::new(1, 2),
        });
        assert_eq!(retry_after(busy), None);
    }
}
