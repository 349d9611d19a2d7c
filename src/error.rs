use axum::http::StatusCode;
use thiserror::Error;

/// Errors surfaced by the lookup pipeline.
///
/// Every variant is recovered at the HTTP boundary and rendered as the
/// uniform `{error, message, code}` payload.
#[derive(Debug, Error)]
pub enum GeoError {
    #[error("Invalid IP address: {0}")]
    InvalidAddress(String),
    #[error("Invalid {family} address: {ip}")]
    WrongAddressFamily { ip: String, family: &'static str },
    #[error("IP address not found in database: {0}")]
    AddressNotFound(String),
    #[error("{0} parameter is required")]
    MissingParameter(&'static str),
    #[error("Invalid query string: {0}")]
    InvalidQuery(String),
    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),
    #[error("Provider '{0}' not found")]
    ProviderNotFound(String),
    #[error("Rate limit exceeded. Too many requests.")]
    RateLimited { retry_after_secs: u64 },
    #[error("API key required. Provide via X-API-Key header, api_key parameter, or Authorization Bearer token")]
    Unauthorized,
    #[error("Invalid API key")]
    Forbidden,
    #[error("Admin API key not configured on server")]
    AdminKeyNotConfigured,
    #[error("Error retrieving GeoIP data: {0}")]
    Lookup(String),
    #[error("Database update failed: {0}")]
    UpdateFailed(String),
    #[error("Failed to serialize response: {0}")]
    SerializationFailure(String),
}

impl GeoError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GeoError::InvalidAddress(_)
            | GeoError::WrongAddressFamily { .. }
            | GeoError::MissingParameter(_)
            | GeoError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            GeoError::AddressNotFound(_) | GeoError::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            GeoError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GeoError::Unauthorized => StatusCode::UNAUTHORIZED,
            GeoError::Forbidden => StatusCode::FORBIDDEN,
            GeoError::DatabaseUnavailable(_)
            | GeoError::AdminKeyNotConfigured
            | GeoError::Lookup(_)
            | GeoError::UpdateFailed(_)
            | GeoError::SerializationFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type GeoResult<T> = Result<T, GeoError>;
