//! Request orchestration: provider selection, caching and resolution

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::GeoCache;
use crate::error::GeoResult;
use crate::geo::resolver::{self, AddressFamily};
use crate::geo::{DatabaseMetadata, GeoRecord, Provider, ProviderInfo, ProviderRegistry};

pub const API_VERSION: &str = "1.0.0";

/// Result of a lookup together with how it was served
#[derive(Debug, Clone)]
pub struct LookupOutcome {
    pub record: GeoRecord,
    pub provider: Arc<Provider>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsDatabases {
    pub city: DatabaseMetadata,
    pub asn: Option<DatabaseMetadata>,
}

/// Metadata for every database of one provider
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub provider: ProviderInfo,
    pub databases: StatsDatabases,
    pub total_records: u64,
    pub last_updated: String,
    pub api_version: &'static str,
    pub generated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseStatus {
    Online,
    Missing,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseHealth {
    pub status: DatabaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDatabases {
    pub city_database: DatabaseHealth,
    pub asn_database: DatabaseHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub api_version: &'static str,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub databases: HealthDatabases,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_records: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvidersReport {
    pub current_provider: ProviderInfo,
    pub available_providers: Vec<ProviderInfo>,
}

pub struct GeoIpService {
    registry: Arc<ProviderRegistry>,
    cache: Option<Arc<dyn GeoCache>>,
    cache_ttl: Duration,
}

impl GeoIpService {
    /// `cache = None` disables caching entirely
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cache: Option<Arc<dyn GeoCache>>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            registry,
            cache,
            cache_ttl,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Resolve `ip`, consulting the cache first.
    ///
    /// # Arguments
    /// * `ip` - Address text as received from the client
    /// * `family` - Address family the endpoint accepts
    /// * `provider` - Optional provider id; unknown ids fall back to the active provider
    ///
    /// # Returns
    /// The record, the provider that served it and whether it came from the
    /// cache. The address is validated before any provider, cache or reader
    /// is touched. Cache failures are logged and bypassed.
    pub async fn lookup(
        &self,
        ip: &str,
        family: AddressFamily,
        provider: Option<&str>,
    ) -> GeoResult<LookupOutcome> {
        let ip = ip.trim();
        let addr = resolver::parse_address(ip, family)?;
        let provider = self.registry.select(provider)?;
        let key = addr.to_string();

        if let Some(cache) = &self.cache {
            match cache.get(provider.id(), &key).await {
                Ok(Some(mut record)) => {
                    debug!(provider = provider.id(), ip, "cache hit");
                    record.ip = ip.to_string();
                    return Ok(LookupOutcome {
                        record,
                        provider,
                        cache_hit: true,
                    });
                }
                Ok(None) => debug!(provider = provider.id(), ip, "cache miss"),
                Err(e) => warn!(provider = provider.id(), error = %e, "Cache read failed, bypassing cache"),
            }
        }

        let record = resolver::lookup(&provider, ip, addr)?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache
                .put(provider.id(), &key, record.clone(), self.cache_ttl)
                .await
            {
                warn!(provider = provider.id(), error = %e, "Cache write failed, result not cached");
            }
        }

        Ok(LookupOutcome {
            record,
            provider,
            cache_hit: false,
        })
    }

    pub fn stats(&self, provider: Option<&str>) -> GeoResult<DatabaseStats> {
        let provider = self.registry.select(provider)?;
        let city = provider.city_reader().metadata();
        let asn = provider.asn_reader().map(|r| r.metadata());

        let total_records = city.record_count + asn.as_ref().map_or(0, |m| m.record_count);
        let last_updated = latest_build(&city, asn.as_ref());

        Ok(DatabaseStats {
            provider: provider.info(),
            databases: StatsDatabases { city, asn },
            total_records,
            last_updated,
            api_version: API_VERSION,
            generated_at: Utc::now().to_rfc3339(),
        })
    }

    /// Always produces a report; an unresolvable provider yields
    /// `status: error`.
    pub fn health(&self, provider: Option<&str>) -> HealthReport {
        let timestamp = Utc::now().to_rfc3339();

        match self.stats(provider) {
            Ok(stats) => {
                let asn_database = match &stats.databases.asn {
                    Some(meta) => online(meta),
                    None => DatabaseHealth {
                        status: DatabaseStatus::Missing,
                        records: None,
                        last_updated: None,
                    },
                };

                HealthReport {
                    status: HealthStatus::Healthy,
                    api_version: API_VERSION,
                    timestamp,
                    provider: Some(stats.provider),
                    error: None,
                    databases: HealthDatabases {
                        city_database: online(&stats.databases.city),
                        asn_database,
                    },
                    total_records: Some(stats.total_records),
                }
            }
            Err(e) => {
                warn!(error = %e, "Health check failed");
                let failed = DatabaseHealth {
                    status: DatabaseStatus::Error,
                    records: None,
                    last_updated: None,
                };
                HealthReport {
                    status: HealthStatus::Error,
                    api_version: API_VERSION,
                    timestamp,
                    provider: None,
                    error: Some(e.to_string()),
                    databases: HealthDatabases {
                        city_database: failed.clone(),
                        asn_database: failed,
                    },
                    total_records: None,
                }
            }
        }
    }

    pub fn providers(&self, provider: Option<&str>) -> GeoResult<ProvidersReport> {
        let current = self.registry.select(provider)?;
        Ok(ProvidersReport {
            current_provider: current.info(),
            available_providers: self.registry.list().iter().map(|p| p.info()).collect(),
        })
    }

    pub fn switch_provider(&self, name: &str) -> GeoResult<Arc<Provider>> {
        self.registry.set_active(name)
    }
}

fn online(meta: &DatabaseMetadata) -> DatabaseHealth {
    DatabaseHealth {
        status: DatabaseStatus::Online,
        records: Some(meta.record_count),
        last_updated: Some(meta.build_date.clone()),
    }
}

fn latest_build(city: &DatabaseMetadata, asn: Option<&DatabaseMetadata>) -> String {
    let parse = |s: &str| DateTime::parse_from_rfc3339(s).ok();

    match asn {
        Some(asn) => match (parse(&city.build_date), parse(&asn.build_date)) {
            (Some(c), Some(a)) if a > c => asn.build_date.clone(),
            (None, Some(_)) => asn.build_date.clone(),
            _ => city.build_date.clone(),
        },
        None => city.build_date.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, CacheResult, MemoryCache};
    use crate::error::GeoError;
    use crate::geo::{AsnData, CityData, MemoryReader};
    use async_trait::async_trait;
    use std::net::IpAddr;

    fn google() -> IpAddr {
        "8.8.8.8".parse().unwrap()
    }

    fn city_reader(name: &str) -> Arc<MemoryReader> {
        Arc::new(MemoryReader::new(name).with_city(
            google(),
            CityData {
                country_code: Some("US".to_string()),
                latitude: Some(37.751),
                longitude: Some(-97.822),
                ..Default::default()
            },
        ))
    }

    fn service_with(reader: Arc<MemoryReader>, cache: Option<Arc<dyn GeoCache>>, ttl: Duration) -> GeoIpService {
        let registry = Arc::new(ProviderRegistry::new());
        registry.insert(Provider::new("maxmind", "MaxMind GeoLite2", reader, None));
        GeoIpService::new(registry, cache, ttl)
    }

    fn memory_cache() -> Arc<dyn GeoCache> {
        Arc::new(MemoryCache::new("geoip_", 1000, Duration::from_secs(3600)))
    }

    struct BrokenCache;

    #[async_trait]
    impl GeoCache for BrokenCache {
        async fn get(&self, _provider: &str, _ip: &str) -> CacheResult<Option<GeoRecord>> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }

        async fn put(&self, _provider: &str, _ip: &str, _record: GeoRecord, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_reader() {
        let reader = city_reader("city");
        let service = service_with(Arc::clone(&reader), Some(memory_cache()), Duration::from_secs(60));

        let first = service.lookup("8.8.8.8", AddressFamily::Any, None).await.unwrap();
        let second = service.lookup("8.8.8.8", AddressFamily::Any, None).await.unwrap();

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.record, second.record);
        assert_eq!(reader.lookups(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_reads_again() {
        let reader = city_reader("city");
        let service = service_with(Arc::clone(&reader), Some(memory_cache()), Duration::from_millis(50));

        service.lookup("8.8.8.8", AddressFamily::Any, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let again = service.lookup("8.8.8.8", AddressFamily::Any, None).await.unwrap();

        assert!(!again.cache_hit);
        assert_eq!(reader.lookups(), 2);
    }

    #[tokio::test]
    async fn test_broken_cache_is_bypassed() {
        let reader = city_reader("city");
        let service = service_with(Arc::clone(&reader), Some(Arc::new(BrokenCache)), Duration::from_secs(60));

        let outcome = service.lookup("8.8.8.8", AddressFamily::Any, None).await.unwrap();
        assert_eq!(outcome.record.country_code.as_deref(), Some("US"));
        assert!(!outcome.cache_hit);
    }

    #[tokio::test]
    async fn test_invalid_address_never_reaches_reader() {
        let reader = city_reader("city");
        let service = service_with(Arc::clone(&reader), Some(memory_cache()), Duration::from_secs(60));

        let err = service.lookup("not-an-ip", AddressFamily::Any, None).await.unwrap_err();
        assert!(matches!(err, GeoError::InvalidAddress(_)));

        let err = service.lookup("::1", AddressFamily::V4, None).await.unwrap_err();
        assert!(matches!(err, GeoError::WrongAddressFamily { .. }));

        assert_eq!(reader.lookups(), 0);
    }

    #[tokio::test]
    async fn test_misses_are_not_cached() {
        let reader = city_reader("city");
        let service = service_with(Arc::clone(&reader), Some(memory_cache()), Duration::from_secs(60));

        for _ in 0..2 {
            let err = service.lookup("10.0.0.1", AddressFamily::Any, None).await.unwrap_err();
            assert!(matches!(err, GeoError::AddressNotFound(_)));
        }
        assert_eq!(reader.lookups(), 2);
    }

    #[tokio::test]
    async fn test_cached_record_keeps_caller_spelling() {
        let reader = Arc::new(MemoryReader::new("city").with_city(
            "::1".parse().unwrap(),
            CityData::default(),
        ));
        let service = service_with(Arc::clone(&reader), Some(memory_cache()), Duration::from_secs(60));

        service.lookup("::1", AddressFamily::Any, None).await.unwrap();
        let hit = service.lookup("0:0::1", AddressFamily::Any, None).await.unwrap();

        assert!(hit.cache_hit);
        assert_eq!(hit.record.ip, "0:0::1");
    }

    #[test]
    fn test_stats_totals() {
        let registry = Arc::new(ProviderRegistry::new());
        let asn = MemoryReader::new("asn").with_asn(
            google(),
            AsnData {
                asn: Some(15169),
                organization: Some("GOOGLE".to_string()),
            },
        );
        registry.insert(Provider::new("maxmind", "MaxMind", city_reader("city"), Some(Arc::new(asn))));
        let service = GeoIpService::new(registry, None, Duration::from_secs(60));

        let stats = service.stats(None).unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.api_version, "1.0.0");
        assert!(stats.databases.asn.is_some());
    }

    #[test]
    fn test_health_without_provider() {
        let service = GeoIpService::new(Arc::new(ProviderRegistry::new()), None, Duration::from_secs(60));
        let health = service.health(None);

        assert_eq!(health.status, HealthStatus::Error);
        assert!(health.error.is_some());
        assert_eq!(health.databases.city_database.status, DatabaseStatus::Error);
    }

    #[test]
    fn test_health_reports_missing_asn() {
        let service = service_with(city_reader("city"), None, Duration::from_secs(60));
        let health = service.health(None);

        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.databases.city_database.status, DatabaseStatus::Online);
        assert_eq!(health.databases.asn_database.status, DatabaseStatus::Missing);
    }

    #[test]
    fn test_latest_build() {
        let city = DatabaseMetadata {
            build_date: "2024-01-01T00:00:00+00:00".to_string(),
            ..Default::default()
        };
        let asn = DatabaseMetadata {
            build_date: "2024-02-01T00:00:00+00:00".to_string(),
            ..Default::default()
        };
        assert_eq!(latest_build(&city, Some(&asn)), asn.build_date);
        assert_eq!(latest_build(&city, None), city.build_date);
    }
}
