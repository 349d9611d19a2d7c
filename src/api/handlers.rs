use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::error::GeoError;
use crate::geo::{AddressFamily, ProviderInfo};
use crate::update::{FileStatus, UpdateOptions, UpdateTarget};

use super::client_ip::ClientIp;
use super::response::{ApiQuery, Negotiated};
use super::AppState;

static PROVIDER_HEADER: HeaderName = HeaderName::from_static("x-geoip-provider");
static CACHE_HIT_HEADER: HeaderName = HeaderName::from_static("x-geoip-cache-hit");

#[derive(Debug, Deserialize)]
pub struct LookupQuery {
    pub ip: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuery {
    pub provider: Option<String>,
    pub force: Option<String>,
    #[serde(rename = "no-backup")]
    pub no_backup: Option<String>,
}

#[derive(Serialize)]
pub struct SwitchResponse {
    pub success: bool,
    pub message: String,
    pub current_provider: ProviderInfo,
}

/// `?force`, `?force=1` and `?force=true` are set; `0`/`false`/`no` are not
fn flag(value: Option<&str>) -> bool {
    match value {
        Some(v) => !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off"),
        None => false,
    }
}

/// API info document
pub async fn root(State(state): State<Arc<AppState>>, negotiated: Negotiated) -> Response {
    let rule = state.public_limit.rule();
    let limit = if rule.max_attempts == 0 {
        "unlimited".to_string()
    } else {
        format!(
            "{} requests per {} minute(s) per IP address and endpoint",
            rule.max_attempts,
            rule.decay_minutes.max(1)
        )
    };

    negotiated.data(&json!({
        "name": "GeoIP API",
        "version": env!("CARGO_PKG_VERSION"),
        "rate_limiting": {
            "limit": limit,
            "headers": {
                "X-RateLimit-Limit": "Maximum requests allowed",
                "X-RateLimit-Remaining": "Requests remaining in current window",
                "X-RateLimit-Reset": "Unix timestamp when rate limit resets"
            }
        },
        "endpoints": {
            "GET /geoip": "Get GeoIP information for any IP address",
            "GET /geoip/ipv4": "Get GeoIP information for IPv4 address only",
            "GET /geoip/ipv6": "Get GeoIP information for IPv6 address only",
            "GET /geoip/stats": "Get database statistics and information",
            "GET /geoip/health": "API health check and basic info",
            "GET /geoip/providers": "Get available providers and current provider info",
            "POST /geoip/switch-provider": "Switch to a different provider",
            "POST /geoip/update": "Update GeoIP databases (maxmind, dbip, or all)"
        },
        "parameters": {
            "ip": "IP address to lookup (optional, defaults to client IP)",
            "format": "Output format: json, xml, csv, yaml (optional, defaults to json)",
            "callback": "JSONP callback function name (optional, JSON format only)",
            "provider": "Provider to use, e.g. maxmind or dbip (per request, or globally via switch-provider)"
        },
        "providers": state.service.registry().ids(),
        "examples": [
            "/geoip?ip=8.8.8.8",
            "/geoip?ip=8.8.8.8&format=xml",
            "/geoip?ip=8.8.8.8&provider=dbip",
            "/geoip/ipv4?ip=8.8.8.8&callback=myCallback",
            "/geoip/stats",
            "/geoip/health",
            "/geoip/providers",
            "/geoip/switch-provider?provider=dbip",
            "POST /geoip/update?provider=dbip",
            "POST /geoip/update?provider=all&force=1&no-backup=1"
        ]
    }))
}

pub async fn lookup(
    State(state): State<Arc<AppState>>,
    negotiated: Negotiated,
    client: ClientIp,
    ApiQuery(query): ApiQuery<LookupQuery>,
) -> Response {
    lookup_family(&state, negotiated, client, query, AddressFamily::Any).await
}

pub async fn lookup_ipv4(
    State(state): State<Arc<AppState>>,
    negotiated: Negotiated,
    client: ClientIp,
    ApiQuery(query): ApiQuery<LookupQuery>,
) -> Response {
    lookup_family(&state, negotiated, client, query, AddressFamily::V4).await
}

pub async fn lookup_ipv6(
    State(state): State<Arc<AppState>>,
    negotiated: Negotiated,
    client: ClientIp,
    ApiQuery(query): ApiQuery<LookupQuery>,
) -> Response {
    lookup_family(&state, negotiated, client, query, AddressFamily::V6).await
}

async fn lookup_family(
    state: &AppState,
    negotiated: Negotiated,
    client: ClientIp,
    query: LookupQuery,
    family: AddressFamily,
) -> Response {
    let ip = query
        .ip
        .filter(|ip| !ip.trim().is_empty())
        .unwrap_or_else(|| client.0.to_string());

    match state
        .service
        .lookup(&ip, family, query.provider.as_deref())
        .await
    {
        Ok(outcome) => {
            let mut response = negotiated.data(&outcome.record);
            if response.status() == StatusCode::OK {
                let headers = response.headers_mut();
                if let Ok(provider) = HeaderValue::from_str(outcome.provider.id()) {
                    headers.insert(PROVIDER_HEADER.clone(), provider);
                }
                headers.insert(
                    CACHE_HIT_HEADER.clone(),
                    HeaderValue::from_static(if outcome.cache_hit { "true" } else { "false" }),
                );
            }
            response
        }
        Err(e) => negotiated.error(&e),
    }
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    negotiated: Negotiated,
    ApiQuery(query): ApiQuery<ProviderQuery>,
) -> Response {
    match state.service.stats(query.provider.as_deref()) {
        Ok(stats) => negotiated.data(&stats),
        Err(e) => negotiated.error(&e),
    }
}

pub async fn health(
    State(state): State<Arc<AppState>>,
    negotiated: Negotiated,
    ApiQuery(query): ApiQuery<ProviderQuery>,
) -> Response {
    negotiated.data(&state.service.health(query.provider.as_deref()))
}

pub async fn providers(
    State(state): State<Arc<AppState>>,
    negotiated: Negotiated,
    ApiQuery(query): ApiQuery<ProviderQuery>,
) -> Response {
    match state.service.providers(query.provider.as_deref()) {
        Ok(report) => negotiated.data(&report),
        Err(e) => negotiated.error(&e),
    }
}

pub async fn switch_provider(
    State(state): State<Arc<AppState>>,
    negotiated: Negotiated,
    ApiQuery(query): ApiQuery<ProviderQuery>,
) -> Response {
    let Some(name) = query
        .provider
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
    else {
        return negotiated.error(&GeoError::MissingParameter("provider"));
    };

    match state.service.switch_provider(&name) {
        Ok(provider) => negotiated.data(&SwitchResponse {
            success: true,
            message: format!("Provider switched to '{}' successfully", name),
            current_provider: provider.info(),
        }),
        Err(e) => negotiated.error(&e),
    }
}

/// Run the refresh job. Any failed file turns the whole response into an
/// `UpdateFailed` error.
pub async fn update(
    State(state): State<Arc<AppState>>,
    negotiated: Negotiated,
    ApiQuery(query): ApiQuery<UpdateQuery>,
) -> Response {
    let target = UpdateTarget::from(query.provider.as_deref().unwrap_or("all"));
    let options = UpdateOptions {
        force: flag(query.force.as_deref()),
        skip_backup: flag(query.no_backup.as_deref()),
    };

    info!("Database update requested for {:?}", target);

    match state.updater.run(&target, options).await {
        Ok(report) if report.success => negotiated.data(&report),
        Ok(report) => {
            let failures: Vec<String> = report
                .providers
                .iter()
                .flat_map(|p| {
                    p.files
                        .iter()
                        .filter(|f| f.status == FileStatus::Failed)
                        .map(move |f| {
                            format!(
                                "{}/{}: {}",
                                p.provider,
                                f.database,
                                f.message.as_deref().unwrap_or("failed")
                            )
                        })
                })
                .collect();
            negotiated.error(&GeoError::UpdateFailed(failures.join("; ")))
        }
        Err(e) => negotiated.error(&e),
    }
}

/// Uniform 404 for unknown routes
pub async fn not_found(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let negotiated = Negotiated::from_parts(request.uri(), request.headers(), &state.formats);
    negotiated.error_with(StatusCode::NOT_FOUND, "Endpoint not found", None)
}
