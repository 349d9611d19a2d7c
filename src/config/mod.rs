use anyhow::Context;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::format::Format;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Provider selected at startup
    pub active_provider: String,
    pub providers: Vec<ProviderConfig>,
    pub cache: CacheConfig,
    pub formats: FormatConfig,
    pub rate_limit: RateLimitConfig,
    pub admin: AdminConfig,
    pub client_ip: ClientIpConfig,
    pub update: UpdateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// One geolocation data source and where its files live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
    pub city_db: PathBuf,
    #[serde(default)]
    pub asn_db: Option<PathBuf>,
    /// Download location for the city database; `{date}` expands to `YYYY-MM`
    #[serde(default)]
    pub city_url: Option<String>,
    #[serde(default)]
    pub asn_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub prefix: String,
    pub max_entries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    pub default: Format,
    pub supported: Vec<Format>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Requests allowed per window; 0 disables limiting
    pub max_attempts: u64,
    pub decay_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub public: RateLimitRule,
    pub admin: RateLimitRule,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustedProxyMode {
    /// Use the socket peer address
    #[default]
    None,
    /// Honour `Forwarded` / `X-Forwarded-For`
    Standard,
    /// Honour `CF-Connecting-IP`
    Cloudflare,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientIpConfig {
    pub trusted_proxy_mode: TrustedProxyMode,
    #[serde(default)]
    pub trusted_proxies: Vec<IpNet>,
    #[serde(default)]
    pub num_trusted_proxies: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    pub backup_dir: PathBuf,
    /// Backups kept per provider
    pub keep_backups: usize,
    /// Files younger than this are skipped unless forced
    pub min_age_hours: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            prefix: "geoip_".to_string(),
            max_entries: 100_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            default: Format::Json,
            supported: Format::ALL.to_vec(),
        }
    }
}

impl RateLimitRule {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.decay_minutes.max(1) * 60)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            public: RateLimitRule {
                max_attempts: 100,
                decay_minutes: 1,
            },
            admin: RateLimitRule {
                max_attempts: 10,
                decay_minutes: 1,
            },
        }
    }
}

impl UpdateConfig {
    fn under(storage_dir: &Path) -> Self {
        Self {
            backup_dir: storage_dir.join("backup"),
            keep_backups: 5,
            min_age_hours: 24,
        }
    }
}

impl ProviderConfig {
    /// MaxMind GeoLite2 and DB-IP Lite laid out under `storage_dir`
    pub fn defaults(storage_dir: &Path) -> Vec<Self> {
        vec![
            ProviderConfig {
                id: "maxmind".to_string(),
                name: "MaxMind GeoLite2".to_string(),
                website: Some(
                    "https://dev.maxmind.com/geoip/geolite2-free-geolocation-data".to_string(),
                ),
                city_db: storage_dir.join("maxmind/GeoLite2-City.mmdb"),
                asn_db: Some(storage_dir.join("maxmind/GeoLite2-ASN.mmdb")),
                city_url: Some("https://git.io/GeoLite2-City.mmdb".to_string()),
                asn_url: Some("https://git.io/GeoLite2-ASN.mmdb".to_string()),
            },
            ProviderConfig {
                id: "dbip".to_string(),
                name: "DB-IP Lite".to_string(),
                website: Some("https://db-ip.com/db/download/ip-to-city-lite".to_string()),
                city_db: storage_dir.join("dbip/dbip-city-lite.mmdb"),
                asn_db: Some(storage_dir.join("dbip/dbip-asn-lite.mmdb")),
                city_url: Some(
                    "https://download.db-ip.com/free/dbip-city-lite-{date}.mmdb.gz".to_string(),
                ),
                asn_url: Some(
                    "https://download.db-ip.com/free/dbip-asn-lite-{date}.mmdb.gz".to_string(),
                ),
            },
        ]
    }

    /// Apply `GEOIP_<ID>_*` overrides
    fn apply_env(mut self) -> Self {
        let prefix = format!("GEOIP_{}", self.id.to_uppercase());

        if let Ok(path) = std::env::var(format!("{prefix}_CITY_DB")) {
            self.city_db = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var(format!("{prefix}_ASN_DB")) {
            self.asn_db = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Ok(url) = std::env::var(format!("{prefix}_CITY_URL")) {
            self.city_url = (!url.is_empty()).then_some(url);
        }
        if let Ok(url) = std::env::var(format!("{prefix}_ASN_URL")) {
            self.asn_url = (!url.is_empty()).then_some(url);
        }

        self
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} has an invalid value '{raw}': {e}")),
        _ => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
        .unwrap_or(default)
}

/// Parse a comma-separated list of formats, skipping unknown entries
pub fn parse_formats(raw: &str) -> Vec<Format> {
    raw.split(',')
        .filter_map(|part| match part.parse::<Format>() {
            Ok(format) => Some(format),
            Err(e) => {
                if !part.trim().is_empty() {
                    tracing::warn!("Ignoring {}", e);
                }
                None
            }
        })
        .collect()
}

/// Parse a comma-separated list of CIDRs or bare addresses
pub fn parse_trusted_proxies(raw: &str) -> anyhow::Result<Vec<IpNet>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>()
                .or_else(|_| s.parse::<std::net::IpAddr>().map(IpNet::from))
                .with_context(|| format!("invalid trusted proxy '{s}'"))
        })
        .collect()
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let host = std::env::var("API_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_or("API_PORT", 8080u16)?;

        let storage_dir = PathBuf::from(
            std::env::var("GEOIP_STORAGE_DIR").unwrap_or_else(|_| "./storage/geoip".to_string()),
        );

        let providers = ProviderConfig::defaults(&storage_dir)
            .into_iter()
            .map(ProviderConfig::apply_env)
            .collect();

        let active_provider = std::env::var("GEOIP_PROVIDER")
            .map(|p| p.trim().to_lowercase())
            .unwrap_or_else(|_| "maxmind".to_string());

        let cache = CacheConfig {
            enabled: env_flag("GEOIP_CACHE_ENABLED", true),
            ttl_secs: env_or("GEOIP_CACHE_TIMEOUT", 3600u64)?,
            prefix: std::env::var("GEOIP_CACHE_PREFIX").unwrap_or_else(|_| "geoip_".to_string()),
            max_entries: env_or("GEOIP_CACHE_MAX_ENTRIES", 100_000u64)?,
        };

        let supported = match std::env::var("GEOIP_SUPPORTED_FORMATS") {
            Ok(raw) => parse_formats(&raw),
            Err(_) => Format::ALL.to_vec(),
        };
        let mut default_format = env_or("GEOIP_DEFAULT_FORMAT", Format::Json)
            .context("GEOIP_DEFAULT_FORMAT must be one of json, xml, csv, yaml")?;
        if !supported.contains(&default_format) {
            tracing::warn!(
                "Default format '{}' is not in the supported list, falling back to json",
                default_format
            );
            default_format = Format::Json;
        }

        let rate_limit = RateLimitConfig {
            public: RateLimitRule {
                max_attempts: env_or("RATE_LIMIT_MAX_ATTEMPTS", 100u64)?,
                decay_minutes: env_or("RATE_LIMIT_DECAY_MINUTES", 1u64)?,
            },
            admin: RateLimitRule {
                max_attempts: env_or("ADMIN_RATE_LIMIT_MAX_ATTEMPTS", 10u64)?,
                decay_minutes: env_or("ADMIN_RATE_LIMIT_DECAY_MINUTES", 1u64)?,
            },
        };

        let api_key = std::env::var("GEOIP_ADMIN_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());

        let trusted_proxy_mode = match std::env::var("TRUSTED_PROXY_MODE")
            .unwrap_or_else(|_| "none".to_string())
            .to_lowercase()
            .as_str()
        {
            "none" => TrustedProxyMode::None,
            "standard" => TrustedProxyMode::Standard,
            "cloudflare" => TrustedProxyMode::Cloudflare,
            other => {
                tracing::warn!(
                    "Unknown TRUSTED_PROXY_MODE '{other}', falling back to 'none'. Supported values: none, standard, cloudflare"
                );
                TrustedProxyMode::None
            }
        };

        let trusted_proxies =
            parse_trusted_proxies(&std::env::var("TRUSTED_PROXIES").unwrap_or_default())?;
        let num_trusted_proxies = std::env::var("NUM_TRUSTED_PROXIES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok());

        let mut update = UpdateConfig::under(&storage_dir);
        if let Ok(dir) = std::env::var("GEOIP_BACKUP_DIR") {
            update.backup_dir = PathBuf::from(dir);
        }
        update.keep_backups = env_or("GEOIP_KEEP_BACKUPS", update.keep_backups)?;
        update.min_age_hours = env_or("GEOIP_REFRESH_MIN_AGE_HOURS", update.min_age_hours)?;

        Ok(Config {
            server: ServerConfig { host, port },
            active_provider,
            providers,
            cache,
            formats: FormatConfig {
                default: default_format,
                supported,
            },
            rate_limit,
            admin: AdminConfig { api_key },
            client_ip: ClientIpConfig {
                trusted_proxy_mode,
                trusted_proxies,
                num_trusted_proxies,
            },
            update,
        })
    }

    /// Configuration rooted at `storage_dir` with every default applied
    pub fn with_storage_dir(storage_dir: &Path) -> Self {
        Config {
            server: ServerConfig::default(),
            active_provider: "maxmind".to_string(),
            providers: ProviderConfig::defaults(storage_dir),
            cache: CacheConfig::default(),
            formats: FormatConfig::default(),
            rate_limit: RateLimitConfig::default(),
            admin: AdminConfig::default(),
            client_ip: ClientIpConfig::default(),
            update: UpdateConfig::under(storage_dir),
        }
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }
}
