//! Verified caller identity.
//!
//! The gateway terminates authentication and forwards the authenticated
//! user id in the `x-user-id` header. Requests without a parseable id are
//! rejected before any handler work.

use axum::extract::FromRequestParts;
use axum::http::{StatusCode, request::Parts};
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Copy)]
pub struct CallerIdentity(pub Uuid);

#[derive(Debug)]
pub struct Unauthorized;

impl IntoResponse for Unauthorized {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({"error": "user not authenticated"})),
        )
            .into_response()
    }
}

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = Unauthorized;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .map(CallerIdentity)
            .ok_or(Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(header: Option<&str>) -> Result<CallerIdentity, Unauthorized> {
        let mut builder = Request::builder().uri("/");
        if let Some(value) = header {
            builder = builder.header(USER_ID_HEADER, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        CallerIdentity::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn accepts_a_valid_uuid() {
        let id = extract(Some("11111111-2222-3333-4444-555555555555")).await.unwrap();
        assert_eq!(id.0.to_string(), "11111111-2222-3333-4444-555555555555");
    }

    #[tokio::test]
    async fn rejects_missing_or_malformed_ids() {
        assert!(extract(None).await.is_err());
        assert!(extract(Some("not-a-uuid")).await.is_err());
    }
}
