//! Caller identity.
//!
//! Authentication happens at the upstream gateway, which forwards the
//! authenticated owner in the `x-owner-id` header.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;

pub const OWNER_HEADER: &str = "x-owner-id";

const MAX_OWNER_LEN: usize = 128;

/// Owner of the tasks and credits a request operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner(pub String);

impl Owner {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn valid_owner_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@')
}

/// Parse a header value into an owner id.
pub fn parse_owner(raw: &str) -> Result<Owner, ApiError> {
    let owner = raw.trim();
    if owner.is_empty() {
        return Err(ApiError::unauthorized("missing owner"));
    }
    if owner.len() > MAX_OWNER_LEN || !owner.chars().all(valid_owner_char) {
        return Err(ApiError::bad_request("malformed owner id"));
    }
    Ok(Owner(owner.to_string()))
}

#[async_trait]
impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or_else(|| ApiError::unauthorized(format!("missing {OWNER_HEADER} header")))?;
        let raw = value
            .to_str()
            .map_err(|_| ApiError::bad_request("malformed owner id"))?;
        parse_owner(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_owner() {
        assert_eq!(parse_owner(" user_42 ").unwrap().as_str(), "user_42");
        assert_eq!(parse_owner("a@b.com").unwrap().as_str(), "a@b.com");
        assert!(matches!(parse_owner(""), Err(ApiError::Unauthorized(_))));
        assert!(matches!(parse_owner("a b"), Err(ApiError::BadRequest(_))));
        assert!(matches!(parse_owner("owner:1"), Err(ApiError::BadRequest(_))));
    }
}
