//! Caller identity from the headers set by the authenticating proxy.

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use tenantry_core::Caller;

use crate::error::ApiError;

pub const REMOTE_EMAIL: &str = "remote-email";
pub const REMOTE_GROUPS: &str = "remote-groups";
pub const DELETE_PASSWORD: &str = "x-delete-password";
pub const SHARED_TOKEN: &str = "x-shared-token";

pub fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name)?.to_str().ok()
}

/// The authenticated caller. Rejects with 401 when `Remote-Email` is
/// missing or blank.
pub struct Identity(pub Caller);

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = header_str(&parts.headers, REMOTE_EMAIL)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::unauthorized("missing Remote-Email header"))?;
        let groups = header_str(&parts.headers, REMOTE_GROUPS).unwrap_or_default();
        Ok(Identity(Caller::with_groups_header(principal, groups)))
    }
}
