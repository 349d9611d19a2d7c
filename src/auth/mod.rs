//! Administrative API key verification

use axum::extract::Query;
use axum::http::{header, HeaderMap, Uri};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::error::{GeoError, GeoResult};

/// Checks a presented key against the configured admin key.
pub struct AdminAuth {
    api_key: Option<String>,
}

impl AdminAuth {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// `AdminKeyNotConfigured` without a server key, `Unauthorized` when
    /// nothing was presented, `Forbidden` on mismatch.
    pub fn verify(&self, presented: Option<&str>) -> GeoResult<()> {
        let expected = self
            .api_key
            .as_deref()
            .ok_or(GeoError::AdminKeyNotConfigured)?;
        let presented = presented
            .filter(|k| !k.is_empty())
            .ok_or(GeoError::Unauthorized)?;

        if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
            Ok(())
        } else {
            Err(GeoError::Forbidden)
        }
    }
}

#[derive(Deserialize)]
struct KeyQuery {
    api_key: Option<String>,
}

/// Key from `X-API-Key`, then `Authorization: Bearer`, then `?api_key=`
pub fn presented_key(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        return Some(key.to_string());
    }

    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(token.to_string());
    }

    Query::<KeyQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.api_key)
        .filter(|k| !k.is_empty())
}

/// First eight characters of a key, for audit logs
pub fn key_prefix(key: &str) -> String {
    key.chars().take(8).collect()
}
