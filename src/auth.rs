use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};

use crate::error::json_error;

const ANONYMOUS: &str = "anonymous";

/// The verified caller a generation is run on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub name: String,
}

impl CallerIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn anonymous() -> Self {
        Self::new(ANONYMOUS)
    }
}

/// Static bearer tokens. With no tokens configured every caller is admitted
/// as `anonymous`.
#[derive(Debug, Clone, Default)]
pub struct AccessTokens {
    tokens: HashMap<String, String>,
}

impl AccessTokens {
    /// Parses `name:token` pairs or bare tokens, comma separated.
    pub fn parse(raw: &str) -> Self {
        let mut tokens = HashMap::new();
        let entries = raw.split(',').map(str::trim).filter(|entry| !entry.is_empty());
        for (index, entry) in entries.enumerate() {
            let (name, token) = match entry.split_once(':') {
                Some((name, token)) if !name.trim().is_empty() => {
                    (name.trim().to_string(), token.trim())
                }
                Some((_, token)) => (format!("user{}", index + 1), token.trim()),
                None => (format!("user{}", index + 1), entry),
            };
            if !token.is_empty() {
                tokens.insert(token.to_string(), name);
            }
        }
        Self { tokens }
    }

    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn verify(&self, token: &str) -> Option<CallerIdentity> {
        self.tokens.get(token).map(|name| CallerIdentity::new(name.clone()))
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Option<CallerIdentity> {
        if self.is_open() {
            return Some(CallerIdentity::anonymous());
        }
        let token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)?;
        self.verify(token)
    }
}

impl<S> FromRequestParts<S> for CallerIdentity
where
    Arc<AccessTokens>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let tokens = Arc::<AccessTokens>::from_ref(state);
        tokens.authenticate(&parts.headers).ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "a valid access token is required",
            )
            .into_response()
        })
    }
}
