//! Request principal.
//!
//! Identity is established upstream; the core trusts the `X-User-Id` and
//! `X-User-Role` headers the edge proxy sets and only decides what a
//! principal may touch.

use std::str::FromStr;

use axum::{
    Json, async_trait,
    extract::FromRequestParts,
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Member,
    Corporate,
    Admin,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "member" | "user" => Ok(Role::Member),
            "corporate" => Ok(Role::Corporate),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Ulid,
    pub role: Role,
}

impl Principal {
    pub fn new(user_id: Ulid, role: Role) -> Self {
        Self { user_id, role }
    }

    pub fn member(user_id: Ulid) -> Self {
        Self::new(user_id, Role::Member)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owners see their own records; admins see everything.
    pub fn can_access(&self, owner: Ulid) -> bool {
        self.is_admin() || self.user_id == owner
    }

    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthRejection> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthRejection::Missing)?
            .parse::<Ulid>()
            .map_err(|_| AuthRejection::Malformed("user id"))?;
        let role = match headers.get(USER_ROLE_HEADER) {
            None => Role::Member,
            Some(v) => v
                .to_str()
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(AuthRejection::Malformed("role"))?,
        };
        Ok(Self { user_id, role })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    Missing,
    Malformed(&'static str),
    Forbidden,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, message, code) = match self {
            AuthRejection::Missing => (
                StatusCode::UNAUTHORIZED,
                "authentication required".to_string(),
                "UNAUTHENTICATED",
            ),
            AuthRejection::Malformed(what) => (
                StatusCode::UNAUTHORIZED,
                format!("malformed principal {what}"),
                "UNAUTHENTICATED",
            ),
            AuthRejection::Forbidden => (
                StatusCode::FORBIDDEN,
                "admin role required".to_string(),
                "FORBIDDEN",
            ),
        };
        let body = serde_json::json!({ "error": message, "code": code });
        (status, Json(body)).into_response()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Principal::from_headers(&parts.headers)
    }
}

/// Principal that must hold the admin role. Inventory, policy and sensor
/// registration sit behind this.
#[derive(Debug, Clone, Copy)]
pub struct Admin(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for Admin
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = Principal::from_headers(&parts.headers)?;
        if !principal.is_admin() {
            return Err(AuthRejection::Forbidden);
        }
        Ok(Admin(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(user: &str, role: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(USER_ID_HEADER, HeaderValue::from_str(user).unwrap());
        if let Some(role) = role {
            h.insert(USER_ROLE_HEADER, HeaderValue::from_str(role).unwrap());
        }
        h
    }

    #[test]
    fn role_defaults_to_member() {
        let id = Ulid::new();
        let p = Principal::from_headers(&headers(&id.to_string(), None)).unwrap();
        assert_eq!(p, Principal::member(id));
    }

    #[test]
    fn admin_can_access_anything() {
        let id = Ulid::new();
        let p = Principal::from_headers(&headers(&id.to_string(), Some("Admin"))).unwrap();
        assert!(p.can_access(Ulid::new()));
        assert!(!Principal::member(id).can_access(Ulid::new()));
    }

    #[test]
    fn rejects_missing_and_garbage() {
        assert_eq!(
            Principal::from_headers(&HeaderMap::new()),
            Err(AuthRejection::Missing)
        );
        assert_eq!(
            Principal::from_headers(&headers("not-a-ulid", None)),
            Err(AuthRejection::Malformed("user id"))
        );
        let id = Ulid::new().to_string();
        assert_eq!(
            Principal::from_headers(&headers(&id, Some("root"))),
            Err(AuthRejection::Malformed("role"))
        );
    }
}
