//! HTTP surface: routing, negotiation, rate limiting and admin auth

pub mod client_ip;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::auth::AdminAuth;
use crate::cache::{GeoCache, MemoryCache};
use crate::config::{ClientIpConfig, Config, FormatConfig};
use crate::geo::ProviderRegistry;
use crate::service::GeoIpService;
use crate::update::DatabaseUpdater;

pub use client_ip::{extract_client_ip, ClientIp};
pub use middleware::RateLimitGuard;
pub use response::{ApiQuery, ErrorPayload, Negotiated, RateLimitDetails};
pub use routes::create_router;

pub struct AppState {
    pub service: GeoIpService,
    pub formats: FormatConfig,
    pub client_ip: ClientIpConfig,
    pub public_limit: RateLimitGuard,
    pub admin_limit: RateLimitGuard,
    pub admin: AdminAuth,
    pub updater: DatabaseUpdater,
}

impl AppState {
    /// Wire the lookup service, limiters, admin auth and updater from
    /// `config` around an already-populated registry.
    pub fn new(config: &Config, registry: Arc<ProviderRegistry>) -> Result<Self> {
        let cache: Option<Arc<dyn GeoCache>> = if config.cache.enabled {
            info!(
                "Lookup cache enabled (ttl: {}s, max entries: {})",
                config.cache.ttl_secs, config.cache.max_entries
            );
            Some(Arc::new(MemoryCache::new(
                config.cache.prefix.clone(),
                config.cache.max_entries,
                config.cache.ttl(),
            )))
        } else {
            info!("Lookup cache disabled");
            None
        };

        let updater = DatabaseUpdater::new(config.providers.clone(), config.update.clone())?
            .with_registry(Arc::clone(&registry));

        Ok(Self {
            service: GeoIpService::new(registry, cache, config.cache.ttl()),
            formats: config.formats.clone(),
            client_ip: config.client_ip.clone(),
            public_limit: RateLimitGuard::new(config.rate_limit.public),
            admin_limit: RateLimitGuard::new(config.rate_limit.admin),
            admin: AdminAuth::new(config.admin.api_key.clone()),
            updater,
        })
    }

    /// Drop closed rate-limit windows
    pub fn purge_rate_limits(&self) {
        self.public_limit.limiter().purge_expired();
        self.admin_limit.limiter().purge_expired();
    }
}
