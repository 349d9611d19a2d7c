use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::auth::{key_prefix, presented_key};
use crate::config::RateLimitRule;
use crate::error::GeoError;
use crate::ratelimit::{RateDecision, RateLimiter};

use super::client_ip;
use super::response::{Negotiated, RateLimitDetails};
use super::AppState;

/// A limiter plus the rule it enforces, for reporting
#[derive(Clone)]
pub struct RateLimitGuard {
    limiter: RateLimiter,
    rule: RateLimitRule,
}

impl RateLimitGuard {
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            limiter: RateLimiter::new(rule.max_attempts, rule.window()),
            rule,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn rule(&self) -> RateLimitRule {
        self.rule
    }

    fn time_window(&self) -> String {
        format!("{} minute(s)", self.rule.decay_minutes.max(1))
    }
}

pub async fn public_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    enforce(&state, &state.public_limit, request, next).await
}

pub async fn admin_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    enforce(&state, &state.admin_limit, request, next).await
}

async fn enforce(state: &AppState, guard: &RateLimitGuard, mut request: Request, next: Next) -> Response {
    let client = client_ip::resolve(request.headers(), request.extensions(), &state.client_ip);
    request.extensions_mut().insert(client);

    let path = request.uri().path().to_string();

    match guard.limiter.check(client.0, &path) {
        RateDecision::Unlimited => next.run(request).await,
        RateDecision::Allowed(status) => {
            let mut response = next.run(request).await;
            status.apply_headers(response.headers_mut(), false);
            response
        }
        RateDecision::Limited(status) => {
            warn!(client = %client.0, path = %path, attempts = status.attempts, "Rate limit exceeded");

            let retry_after = status.retry_after_secs();
            let reset_time = Utc::now() + chrono::Duration::seconds(retry_after as i64);
            let details = RateLimitDetails {
                max_attempts: status.limit,
                current_attempts: status.attempts,
                time_window: guard.time_window(),
                retry_after: format!("{} seconds", retry_after),
                reset_time: reset_time.to_rfc3339(),
            };

            let err = GeoError::RateLimited {
                retry_after_secs: retry_after,
            };
            let negotiated = Negotiated::from_parts(request.uri(), request.headers(), &state.formats);
            let mut response = negotiated.error_with(err.status_code(), err.to_string(), Some(details));
            status.apply_headers(response.headers_mut(), true);
            response
        }
    }
}

/// Gate administrative routes on the configured API key, with audit logging
pub async fn require_admin_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_ip::resolve(request.headers(), request.extensions(), &state.client_ip);
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let path = request.uri().path().to_string();
    let key = presented_key(request.headers(), request.uri());

    match state.admin.verify(key.as_deref()) {
        Ok(()) => {
            info!(client = %client.0, user_agent = %user_agent, path = %path, "Admin API access granted");
            next.run(request).await
        }
        Err(err) => {
            match &err {
                GeoError::AdminKeyNotConfigured => {
                    error!(client = %client.0, path = %path, "Admin API key not configured");
                }
                GeoError::Forbidden => warn!(
                    client = %client.0,
                    user_agent = %user_agent,
                    path = %path,
                    key_prefix = %key.as_deref().map(key_prefix).unwrap_or_default(),
                    "Invalid admin API key"
                ),
                _ => warn!(
                    client = %client.0,
                    user_agent = %user_agent,
                    path = %path,
                    "Admin API request without key"
                ),
            }

            let negotiated = Negotiated::from_parts(request.uri(), request.headers(), &state.formats);
            negotiated.error(&err)
        }
    }
}
