//! Shared fixtures for the HTTP integration tests
#![allow(dead_code)]

use axum::{body::Body, http::Request, response::Response, Router};
use geoip_api::api::{create_router, AppState};
use geoip_api::config::Config;
use geoip_api::geo::{AsnData, CityData, MemoryReader, Provider, ProviderRegistry};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tower::Layer;

pub const GOOGLE_V4: &str = "8.8.8.8";
pub const GOOGLE_V6: &str = "2001:4860:4860::8888";

/// Helper layer to inject ConnectInfo for tests
#[derive(Clone)]
pub struct TestConnectInfoLayer {
    addr: SocketAddr,
}

impl TestConnectInfoLayer {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            addr: SocketAddr::new(ip, 12345),
        }
    }
}

impl<S> Layer<S> for TestConnectInfoLayer {
    type Service = TestConnectInfoMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TestConnectInfoMiddleware {
            inner,
            addr: self.addr,
        }
    }
}

#[derive(Clone)]
pub struct TestConnectInfoMiddleware<S> {
    inner: S,
    addr: SocketAddr,
}

impl<S, B> tower::Service<Request<B>> for TestConnectInfoMiddleware<S>
where
    S: tower::Service<Request<B>> + Clone,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        req.extensions_mut()
            .insert(axum::extract::connect_info::ConnectInfo(self.addr));
        self.inner.call(req)
    }
}

/// Config with generous limits, rooted at `dir`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::with_storage_dir(dir);
    config.rate_limit.public.max_attempts = 10_000;
    config.rate_limit.admin.max_attempts = 10_000;
    config
}

fn city(country_code: &str, city: &str) -> CityData {
    CityData {
        country_code: Some(country_code.to_string()),
        country: Some("United States".to_string()),
        region_code: Some("CA".to_string()),
        region: Some("California".to_string()),
        city: Some(city.to_string()),
        postal_code: Some("94043".to_string()),
        continent_code: Some("NA".to_string()),
        latitude: Some(37.4223),
        longitude: Some(-122.085),
        timezone: Some("America/Los_Angeles".to_string()),
        organization: None,
    }
}

/// Two in-memory providers that disagree on the city name, so tests can
/// tell which one answered
pub fn test_registry() -> Arc<ProviderRegistry> {
    let v4: IpAddr = GOOGLE_V4.parse().unwrap();
    let v6: IpAddr = GOOGLE_V6.parse().unwrap();
    let google_asn = AsnData {
        asn: Some(15169),
        organization: Some("GOOGLE".to_string()),
    };

    let maxmind_city = MemoryReader::new("GeoLite2-City")
        .with_city(v4, city("US", "Mountain View"))
        .with_city(v6, city("US", "Mountain View"));
    let maxmind_asn = MemoryReader::new("GeoLite2-ASN")
        .with_asn(v4, google_asn.clone())
        .with_asn(v6, google_asn);

    let dbip_city = MemoryReader::new("dbip-city-lite").with_city(v4, city("US", "Sunnyvale"));

    let registry = Arc::new(ProviderRegistry::new());
    registry.insert(
        Provider::new(
            "maxmind",
            "MaxMind GeoLite2",
            Arc::new(maxmind_city),
            Some(Arc::new(maxmind_asn)),
        )
        .with_website("https://dev.maxmind.com/geoip/geolite2-free-geolocation-data"),
    );
    registry.insert(Provider::new("dbip", "DB-IP Lite", Arc::new(dbip_city), None));
    registry
}

pub fn build_app(config: &Config, registry: Arc<ProviderRegistry>, client: IpAddr) -> Router {
    let state = Arc::new(AppState::new(config, registry).unwrap());
    create_router(state).layer(TestConnectInfoLayer::new(client))
}

pub fn default_app() -> Router {
    build_app(
        &test_config(Path::new("/tmp/geoip-api-tests")),
        test_registry(),
        "203.0.113.10".parse().unwrap(),
    )
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}

pub fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}
