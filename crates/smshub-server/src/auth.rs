//! 调用方提取
//!
//! 身份由前置网关认证后通过请求头传进来，这里不做认证，只做解析。

use axum::{extract::FromRequestParts, http::request::Parts};
use smshub_core::{Caller, CallerRole};

use crate::errors::AppError;

pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const CALLER_ROLE_HEADER: &str = "x-caller-role";

/// 当前请求的调用方
#[derive(Debug, Clone)]
pub struct CurrentCaller(pub Caller);

impl<S> FromRequestParts<S> for CurrentCaller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(CALLER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::unauthorized(format!("missing {} header", CALLER_ID_HEADER)))?;

        let role = match parts.headers.get(CALLER_ROLE_HEADER).map(|value| value.to_str()) {
            None => CallerRole::Member,
            Some(Ok(raw)) => parse_role(raw)?,
            Some(Err(_)) => return Err(AppError::bad_request("invalid caller role header")),
        };

        Ok(CurrentCaller(Caller { id: id.to_string(), role }))
    }
}

fn parse_role(raw: &str) -> Result<CallerRole, AppError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "operator" => Ok(CallerRole::Operator),
        "member" | "" => Ok(CallerRole::Member),
        other => Err(AppError::bad_request(format!("unknown caller role: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    async fn extract(request: Request<()>) -> Result<CurrentCaller, AppError> {
        let (mut parts, _) = request.into_parts();
        CurrentCaller::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn test_caller_from_headers() {
        let request = Request::builder()
            .header(CALLER_ID_HEADER, "emp-1")
            .body(())
            .unwrap();
        let CurrentCaller(caller) = extract(request).await.unwrap();
        assert_eq!(caller, Caller::member("emp-1"));

        let request = Request::builder()
            .header(CALLER_ID_HEADER, "ops")
            .header(CALLER_ROLE_HEADER, "Operator")
            .body(())
            .unwrap();
        let CurrentCaller(caller) = extract(request).await.unwrap();
        assert!(caller.is_operator());
    }

    #[tokio::test]
    async fn test_missing_or_bad_headers_are_rejected() {
        let err = extract(Request::builder().body(()).unwrap()).await.unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .header(CALLER_ID_HEADER, "emp-1")
            .header(CALLER_ROLE_HEADER, "root")
            .body(())
            .unwrap();
        assert_eq!(extract(request).await.unwrap_err().status, StatusCode::BAD_REQUEST);
    }
}
