use anyhow::{bail, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use geoip_api::api::{self, AppState};
use geoip_api::config::Config;
use geoip_api::geo::ProviderRegistry;

const RATE_LIMIT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration");

    // Open provider databases
    let registry = Arc::new(ProviderRegistry::new());
    for provider in &config.providers {
        match registry.register(provider) {
            Ok(p) => info!("Registered provider '{}' ({})", p.id(), p.name()),
            Err(e) => warn!("Skipping provider '{}': {}", provider.id, e),
        }
    }

    if registry.is_empty() {
        bail!(
            "No GeoIP provider could be opened. Run `geoip-update all` to download databases into the storage directory"
        );
    }

    if let Err(e) = registry.set_active(&config.active_provider) {
        warn!(
            "Configured provider '{}' unavailable ({}), keeping '{}'",
            config.active_provider,
            e,
            registry.active()?.id()
        );
    }

    if config.admin.api_key.is_none() {
        warn!("GEOIP_ADMIN_API_KEY is not set; /geoip/update will refuse all requests");
    }

    let state = Arc::new(AppState::new(&config, Arc::clone(&registry))?);

    // Periodically drop closed rate-limit windows
    let purge_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RATE_LIMIT_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            purge_state.purge_rate_limits();
        }
    });

    let app = api::create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 GeoIP API listening on http://{}", addr);
    info!("   - Active provider: {}", registry.active()?.id());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
