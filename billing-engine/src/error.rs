//! Domain error for the billing engine.

use crate::services::collaborators::CollaboratorError;
use service_core::error::AppError;
use thiserror::Error;

/// Failure of a billing command or query.
///
/// Domain methods return these before mutating anything, so a rejected command
/// always leaves the aggregate exactly as it was.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid {entity} transition: cannot {requested} while {from}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        requested: &'static str,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl BillingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        BillingError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(
        entity: &'static str,
        from: impl ToString,
        requested: &'static str,
    ) -> Self {
        BillingError::InvalidStateTransition {
            entity,
            from: from.to_string(),
            requested,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        BillingError::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        BillingError::Conflict(message.into())
    }

    /// Short label used for the error metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::NotFound { .. } => "not_found",
            BillingError::InvalidStateTransition { .. } => "invalid_state_transition",
            BillingError::Validation(_) => "validation",
            BillingError::Conflict(_) => "conflict",
            BillingError::Storage(_) => "storage",
            BillingError::Collaborator(_) => "collaborator",
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                return BillingError::Conflict(format!(
                    "Unique constraint violated: {}",
                    db_err.constraint().unwrap_or("unknown")
                ));
            }
        }
        BillingError::Storage(anyhow::Error::new(err))
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::NotFound { .. } => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            BillingError::InvalidStateTransition { .. } => {
                AppError::InvalidState(anyhow::anyhow!(err.to_string()))
            }
            BillingError::Validation(msg) => AppError::BadRequest(anyhow::anyhow!(msg)),
            BillingError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            BillingError::Storage(e) => AppError::DatabaseError(e),
            BillingError::Collaborator(e) => AppError::InternalError(anyhow::Error::new(e)),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    fn status_of(err: BillingError) -> StatusCode {
        AppError::from(err).into_response().status()
    }

    #[test]
    fn domain_errors_map_to_http_statuses() {
        assert_eq!(
            status_of(BillingError::not_found("invoice", "INV-2026-00001")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(BillingError::invalid_transition("invoice", "paid", "cancel")),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(BillingError::validation("Tax rate must be between 0 and 100")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(BillingError::conflict("Invoice changed since it was read")),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(BillingError::Storage(anyhow::anyhow!("pool timed out"))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(BillingError::Collaborator(CollaboratorError::Unavailable(
                "gateway down".to_string()
            ))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn validation_message_survives_the_mapping() {
        let app_error = AppError::from(BillingError::validation("Plan name is required"));
        assert!(matches!(app_error, AppError::BadRequest(_)));
        assert_eq!(app_error.to_string(), "Bad request: Plan name is required");
    }
}
