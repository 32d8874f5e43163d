//! Principal extraction for API routes.
//!
//! Authentication happens in front of this service. The gateway forwards the
//! verified identity as headers:
//! - `X-User-Id` (required)
//! - `X-Org-Id`, `X-User-Role`, `X-Username` (optional)

use axum::{
    async_trait,
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};

use agentline_core::types::{Principal, Role};

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const ORG_ID_HEADER: &str = "X-Org-Id";
pub const ROLE_HEADER: &str = "X-User-Role";
pub const USERNAME_HEADER: &str = "X-Username";

/// Extractor for routes that need the calling principal.
pub struct CurrentUser(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| AppError::Unauthorized("Not authenticated".to_string()))
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Build the principal from forwarded identity headers
pub fn principal_from_headers(headers: &HeaderMap) -> Option<Principal> {
    let user_id = header(headers, USER_ID_HEADER)?;
    Some(Principal {
        user_id: user_id.to_string(),
        org_id: header(headers, ORG_ID_HEADER).map(str::to_string),
        username: header(headers, USERNAME_HEADER).map(str::to_string),
        role: header(headers, ROLE_HEADER)
            .map(Role::parse)
            .unwrap_or_default(),
    })
}

/// Middleware that rejects requests without a principal and attaches it otherwise.
pub async fn auth_middleware(mut request: Request, next: Next) -> Response {
    match principal_from_headers(request.headers()) {
        Some(principal) => {
            tracing::debug!(
                "Request {} {} from user {}",
                request.method(),
                request.uri().path(),
                principal.user_id
            );
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        None => AppError::Unauthorized(format!("Missing {} header", USER_ID_HEADER))
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn principal_requires_user_id() {
        let mut headers = HeaderMap::new();
        headers.insert(ORG_ID_HEADER, HeaderValue::from_static("acme"));
        assert!(principal_from_headers(&headers).is_none());

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("   "));
        assert!(principal_from_headers(&headers).is_none());
    }

    #[test]
    fn optional_headers_fill_the_principal() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u-1"));
        headers.insert(ORG_ID_HEADER, HeaderValue::from_static("acme"));
        headers.insert(ROLE_HEADER, HeaderValue::from_static("Admin"));
        headers.insert(USERNAME_HEADER, HeaderValue::from_static("alice"));

        let principal = principal_from_headers(&headers).expect("principal");
        assert_eq!(principal.user_id, "u-1");
        assert_eq!(principal.org_id.as_deref(), Some("acme"));
        assert_eq!(principal.username.as_deref(), Some("alice"));
        assert!(principal.is_elevated());
    }

    #[test]
    fn unknown_role_is_a_member() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u-2"));
        headers.insert(ROLE_HEADER, HeaderValue::from_static("viewer"));
        let principal = principal_from_headers(&headers).expect("principal");
        assert_eq!(principal.role, Role::Member);
    }
}
