//! Caller identity. Authentication happens upstream; requests arrive with
//! the already-validated numeric user id in `x-user-id`.

use crate::{errors::AppError, models::UserId};
use axum::{extract::FromRequestParts, http::request::Parts};

pub const USER_ID_HEADER: &str = "x-user-id";

/// The user a request acts on behalf of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller(pub UserId);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::unauthenticated(format!("missing `{}` header", USER_ID_HEADER)))?;

        raw.to_str()
            .ok()
            .and_then(|value| value.trim().parse::<UserId>().ok())
            .filter(|id| *id > 0)
            .map(Caller)
            .ok_or_else(|| AppError::unauthenticated(format!("invalid `{}` header", USER_ID_HEADER)))
    }
}
