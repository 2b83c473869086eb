use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use smshub_core::{ErrorKind, SmsHubError};
use std::fmt;
use tracing::error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub kind: Option<ErrorKind>,
    pub retryable: bool,
    pub hint: Option<&'static str>,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: None,
            retryable: false,
            hint: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "status": self.status.as_u16(),
                "kind": self.kind,
                "retryable": self.retryable,
                "hint": self.hint,
            }
        }));

        (self.status, body).into_response()
    }
}

fn status_for(err: &SmsHubError) -> StatusCode {
    if matches!(err, SmsHubError::ShuttingDown(_)) {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match err.kind() {
        ErrorKind::ProviderUnavailable | ErrorKind::RelayExhausted => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ProviderRejected => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::ParseFailure => StatusCode::BAD_GATEWAY,
        ErrorKind::DuplicateAssignment | ErrorKind::AlreadyTerminal => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::InvalidArgument | ErrorKind::InvalidOperation => StatusCode::BAD_REQUEST,
        ErrorKind::Config | ErrorKind::Storage | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<SmsHubError> for AppError {
    fn from(err: SmsHubError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            error!("请求失败: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
            kind: Some(err.kind()),
            retryable: err.is_retryable(),
            hint: Some(err.hint()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smshub_core::{ProviderKind, RentalStatus};

    #[test]
    fn test_status_mapping() {
        let unavailable = AppError::from(SmsHubError::ProviderUnavailable {
            provider: ProviderKind::Rest,
            reason: "connect timeout".into(),
        });
        assert_eq!(unavailable.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(unavailable.retryable);

        let terminal = AppError::from(SmsHubError::AlreadyTerminal {
            rental_id: "r1".into(),
            status: RentalStatus::Expired,
        });
        assert_eq!(terminal.status, StatusCode::CONFLICT);
        assert!(!terminal.retryable);
        assert_eq!(terminal.kind, Some(ErrorKind::AlreadyTerminal));

        assert_eq!(AppError::from(SmsHubError::NotFound("r9".into())).status, StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::from(SmsHubError::InvalidOperation("x".into())).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::from(SmsHubError::ShuttingDown("stopping".into())).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
