use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::{header, request::Parts, StatusCode},
    RequestPartsExt,
};
use serde::Deserialize;

/// The member token of a request, from `Authorization: Bearer` or `?token=`.
///
/// Which room it belongs to is checked by the handler, since that depends on
/// the path.
pub struct MemberToken(String);

impl MemberToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for MemberToken
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let in_query = parts
            .extract::<Query<TokenQuery>>()
            .await
            .ok()
            .map(|x| format!("Bearer {}", x.token));

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|x| x.to_str().ok())
            .or(in_query.as_deref())
            .ok_or((StatusCode::UNAUTHORIZED, "Missing authorization"))?;

        let parts: Vec<_> = token.split_ascii_whitespace().collect();

        if parts.first() != Some(&"Bearer") {
            return Err((StatusCode::BAD_REQUEST, "Authorization must be Bearer"));
        }

        let token = parts.last().cloned().unwrap_or_default();
        Ok(Self(token.to_string()))
    }
}
