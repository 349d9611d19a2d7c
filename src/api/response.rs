use axum::{
    extract::{FromRequestParts, Query},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::error;

use crate::config::FormatConfig;
use crate::error::GeoError;
use crate::format::{self, Format, PayloadKind};

use super::AppState;

/// Uniform error body
#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub error: bool,
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<RateLimitDetails>,
}

/// Extra context attached to 429 responses
#[derive(Debug, Serialize)]
pub struct RateLimitDetails {
    pub max_attempts: u64,
    pub current_attempts: u64,
    pub time_window: String,
    pub retry_after: String,
    pub reset_time: String,
}

#[derive(Debug, Default, Deserialize)]
struct FormatQuery {
    format: Option<String>,
    callback: Option<String>,
}

/// Output format and JSONP callback chosen for a request
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub format: Format,
    pub callback: Option<String>,
}

impl Negotiated {
    pub fn from_parts(uri: &Uri, headers: &HeaderMap, formats: &FormatConfig) -> Self {
        let query = Query::<FormatQuery>::try_from_uri(uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());

        Self {
            format: format::negotiate(
                query.format.as_deref(),
                accept,
                &formats.supported,
                formats.default,
            ),
            callback: query.callback,
        }
    }

    /// Render a 200 data payload
    pub fn data<T: Serialize>(&self, payload: &T) -> Response {
        self.respond(StatusCode::OK, PayloadKind::Data, payload)
    }

    pub fn error(&self, err: &GeoError) -> Response {
        self.error_with(err.status_code(), err.to_string(), None)
    }

    pub fn error_with(
        &self,
        status: StatusCode,
        message: impl Into<String>,
        details: Option<RateLimitDetails>,
    ) -> Response {
        let payload = ErrorPayload {
            error: true,
            message: message.into(),
            code: status.as_u16(),
            details,
        };
        self.respond(status, PayloadKind::Error, &payload)
    }

    pub fn respond<T: Serialize>(&self, status: StatusCode, kind: PayloadKind, payload: &T) -> Response {
        let rendered = serde_json::to_value(payload)
            .map_err(format::SerializeError::from)
            .and_then(|value| format::render(self.format, kind, &value, self.callback.as_deref()));

        match rendered {
            Ok(rendered) => (
                status,
                [(header::CONTENT_TYPE, HeaderValue::from_static(rendered.content_type))],
                rendered.body,
            )
                .into_response(),
            Err(e) => serialization_failure(e),
        }
    }
}

impl FromRequestParts<Arc<AppState>> for Negotiated {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(Negotiated::from_parts(&parts.uri, &parts.headers, &state.formats))
    }
}

/// Query string extractor whose rejection is a negotiated error payload
#[derive(Debug, Clone)]
pub struct ApiQuery<T>(pub T);

impl<T> FromRequestParts<Arc<AppState>> for ApiQuery<T>
where
    T: DeserializeOwned + Send,
{
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        parse_query(&parts.uri)
            .map(ApiQuery)
            .map_err(|err| Negotiated::from_parts(&parts.uri, &parts.headers, &state.formats).error(&err))
    }
}

/// Deserialize the query string of `uri`, keeping only serde's reason
pub fn parse_query<T: DeserializeOwned>(uri: &Uri) -> Result<T, GeoError> {
    Query::<T>::try_from_uri(uri)
        .map(|Query(query)| query)
        .map_err(|rejection| {
            let text = rejection.body_text();
            let reason = text
                .strip_prefix("Failed to deserialize query string: ")
                .unwrap_or(&text);
            GeoError::InvalidQuery(reason.to_string())
        })
}

/// Plain-text 500 used when the chosen serializer itself fails
fn serialization_failure(e: format::SerializeError) -> Response {
    let err = GeoError::SerializationFailure(e.to_string());
    error!("{}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        err.to_string(),
    )
        .into_response()
}
