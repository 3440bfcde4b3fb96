use axum::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;

/// Shared-secret gate for the dashboard API. Accepts the secret from the
/// `dashboard_auth` cookie set by the password gate or as a bearer token.
pub struct DashboardAuth;

#[async_trait]
impl<S> FromRequestParts<S> for DashboardAuth
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let presented = if let Some(cookie_header) = parts.headers.get(axum::http::header::COOKIE) {
            let cookies = cookie_header.to_str().unwrap_or("");
            cookies.split(';').find_map(|c| {
                let c = c.trim();
                c.strip_prefix("dashboard_auth=").map(|s| s.to_string())
            })
        } else if let Some(authz) = parts.headers.get(axum::http::header::AUTHORIZATION) {
            authz
                .to_str()
                .ok()
                .and_then(|s| s.strip_prefix("Bearer ").map(|s| s.to_string()))
        } else {
            None
        };
        let presented = presented.ok_or(AppError::Unauthorized)?;
        if presented != crate::config::DASHBOARD_SECRET.as_str() {
            return Err(AppError::Unauthorized);
        }
        Ok(DashboardAuth)
    }
}
