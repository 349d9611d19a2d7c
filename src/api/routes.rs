use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

use super::handlers;
use super::middleware::{admin_rate_limit, public_rate_limit, require_admin_key};
use super::AppState;

const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, Accept, Authorization, X-API-Key";

pub fn create_router(state: Arc<AppState>) -> Router {
    let public_routes = Router::new()
        .route("/geoip", get(handlers::lookup))
        .route("/geoip/ipv4", get(handlers::lookup_ipv4))
        .route("/geoip/ipv6", get(handlers::lookup_ipv6))
        .route("/geoip/stats", get(handlers::stats))
        .route("/geoip/health", get(handlers::health))
        .route("/geoip/providers", get(handlers::providers))
        .route(
            "/geoip/switch-provider",
            get(handlers::switch_provider).post(handlers::switch_provider),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            public_rate_limit,
        ));

    // Rate limiting runs before the key check
    let admin_routes = Router::new()
        .route("/geoip/update", get(handlers::update).post(handlers::update))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_admin_key,
        ))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            admin_rate_limit,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
        ]);

    Router::new()
        .route("/", get(handlers::root))
        .merge(public_routes)
        .merge(admin_routes)
        .fallback(handlers::not_found)
        .layer(
            ServiceBuilder::new()
                .layer(SetResponseHeaderLayer::overriding(
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::ACCESS_CONTROL_ALLOW_METHODS,
                    HeaderValue::from_static(ALLOWED_METHODS),
                ))
                .layer(SetResponseHeaderLayer::overriding(
                    header::ACCESS_CONTROL_ALLOW_HEADERS,
                    HeaderValue::from_static(ALLOWED_HEADERS),
                ))
                .layer(cors),
        )
        .with_state(state)
}
