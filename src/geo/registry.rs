//! Named geolocation providers and the process-wide active selection

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

use crate::config::ProviderConfig;
use crate::error::{GeoError, GeoResult};
use crate::geo::reader::{GeoReader, MmdbReader};

/// A named data source backed by a city reader and an optional ASN reader.
///
/// Never mutated after construction; switching providers swaps the `Arc`.
pub struct Provider {
    id: String,
    name: String,
    website: Option<String>,
    city_path: Option<PathBuf>,
    asn_path: Option<PathBuf>,
    city: Arc<dyn GeoReader>,
    asn: Option<Arc<dyn GeoReader>>,
}

/// Public description of a provider
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub website: Option<String>,
    pub city_database: Option<String>,
    pub asn_database: Option<String>,
}

impl Provider {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        city: Arc<dyn GeoReader>,
        asn: Option<Arc<dyn GeoReader>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            website: None,
            city_path: None,
            asn_path: None,
            city,
            asn,
        }
    }

    /// Open the database files named by `config`.
    ///
    /// # Arguments
    /// * `config` - Provider entry naming the city database and, optionally, the ASN database
    ///
    /// # Returns
    /// A provider with memory-mapped readers, or `DatabaseUnavailable` when a
    /// file is missing or cannot be opened as a MaxMind DB
    pub fn open(config: &ProviderConfig) -> GeoResult<Self> {
        let city = open_database(&config.city_db)?;
        let asn = match &config.asn_db {
            Some(path) => Some(open_database(path)?),
            None => None,
        };

        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            website: config.website.clone(),
            city_path: Some(config.city_db.clone()),
            asn_path: config.asn_db.clone(),
            city,
            asn,
        })
    }

    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn city_reader(&self) -> &dyn GeoReader {
        self.city.as_ref()
    }

    pub fn asn_reader(&self) -> Option<&dyn GeoReader> {
        self.asn.as_deref()
    }

    pub fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            website: self.website.clone(),
            city_database: self.city_path.as_ref().map(|p| p.display().to_string()),
            asn_database: self.asn_path.as_ref().map(|p| p.display().to_string()),
        }
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("has_asn", &self.asn.is_some())
            .finish_non_exhaustive()
    }
}

fn open_database(path: &Path) -> GeoResult<Arc<dyn GeoReader>> {
    if !path.exists() {
        return Err(GeoError::DatabaseUnavailable(format!(
            "GeoIP database file not found: {}",
            path.display()
        )));
    }

    let reader = MmdbReader::open(path)
        .map_err(|e| GeoError::DatabaseUnavailable(format!("{:#}", e)))?;
    Ok(Arc::new(reader))
}

/// Registry of providers with an atomically swappable active provider.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<Provider>>,
    /// Registration order, for listings
    order: RwLock<Vec<String>>,
    active: ArcSwapOption<Provider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open and register a provider from configuration
    pub fn register(&self, config: &ProviderConfig) -> GeoResult<Arc<Provider>> {
        let provider = Provider::open(config)?;
        Ok(self.insert(provider))
    }

    /// Register an already-built provider.
    ///
    /// Replaces any provider with the same id. When the replaced provider
    /// was active, the active reference moves to the new instance. The first
    /// provider ever registered becomes active.
    pub fn insert(&self, provider: Provider) -> Arc<Provider> {
        let provider = Arc::new(provider);
        let id = provider.id().to_string();

        let replaced = self
            .providers
            .insert(id.clone(), Arc::clone(&provider))
            .is_some();

        if !replaced {
            self.order
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(id.clone());
        }

        // Take the slot only while it is empty or still holds this id
        let previous = self.active.rcu(|current| match current {
            Some(active) if active.id() != id => Some(Arc::clone(active)),
            _ => Some(Arc::clone(&provider)),
        });

        match previous {
            None => info!("Provider '{}' is now active", id),
            Some(previous) if previous.id() == id => info!("Active provider '{}' reloaded", id),
            Some(_) => {}
        }

        provider
    }

    pub fn get(&self, name: &str) -> GeoResult<Arc<Provider>> {
        self.providers
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| GeoError::ProviderNotFound(name.to_string()))
    }

    /// Make `name` the process-wide default provider
    pub fn set_active(&self, name: &str) -> GeoResult<Arc<Provider>> {
        let provider = self.get(name)?;
        self.active.store(Some(Arc::clone(&provider)));
        info!("Switched active provider to '{}'", name);
        Ok(provider)
    }

    pub fn active(&self) -> GeoResult<Arc<Provider>> {
        self.active
            .load_full()
            .ok_or_else(|| GeoError::DatabaseUnavailable("no provider is configured".to_string()))
    }

    /// Resolve a per-request override without touching the active provider
    pub fn select(&self, requested: Option<&str>) -> GeoResult<Arc<Provider>> {
        match requested {
            Some(name) => self.get(name).or_else(|err| {
                tracing::warn!(
                    "Requested provider unavailable ({}), falling back to active provider",
                    err
                );
                self.active()
            }),
            None => self.active(),
        }
    }

    /// Registered provider ids in registration order
    pub fn ids(&self) -> Vec<String> {
        self.order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn list(&self) -> Vec<Arc<Provider>> {
        self.ids()
            .iter()
            .filter_map(|id| self.get(id).ok())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::reader::MemoryReader;

    fn memory_provider(id: &str) -> Provider {
        Provider::new(id, id.to_uppercase(), Arc::new(MemoryReader::new(id)), None)
    }

    #[test]
    fn test_first_registered_provider_is_active() {
        let registry = ProviderRegistry::new();
        registry.insert(memory_provider("maxmind"));
        registry.insert(memory_provider("dbip"));

        assert_eq!(registry.active().unwrap().id(), "maxmind");
        assert_eq!(registry.ids(), vec!["maxmind", "dbip"]);
    }

    #[test]
    fn test_set_active_swaps_reference() {
        let registry = ProviderRegistry::new();
        registry.insert(memory_provider("maxmind"));
        let dbip = registry.insert(memory_provider("dbip"));

        registry.set_active("dbip").unwrap();
        assert!(Arc::ptr_eq(&registry.active().unwrap(), &dbip));
    }

    #[test]
    fn test_set_active_unknown_provider() {
        let registry = ProviderRegistry::new();
        registry.insert(memory_provider("maxmind"));

        let err = registry.set_active("nope").unwrap_err();
        assert!(matches!(err, GeoError::ProviderNotFound(_)));
        assert_eq!(registry.active().unwrap().id(), "maxmind");
    }

    #[test]
    fn test_active_without_providers() {
        let registry = ProviderRegistry::new();
        assert!(matches!(
            registry.active(),
            Err(GeoError::DatabaseUnavailable(_))
        ));
    }

    #[test]
    fn test_select_falls_back_to_active() {
        let registry = ProviderRegistry::new();
        registry.insert(memory_provider("maxmind"));
        registry.insert(memory_provider("dbip"));

        assert_eq!(registry.select(Some("dbip")).unwrap().id(), "dbip");
        assert_eq!(registry.select(Some("unknown")).unwrap().id(), "maxmind");
        assert_eq!(registry.select(None).unwrap().id(), "maxmind");
        // Overrides never change the global selection
        assert_eq!(registry.active().unwrap().id(), "maxmind");
    }

    #[test]
    fn test_reinsert_replaces_active_instance() {
        let registry = ProviderRegistry::new();
        let old = registry.insert(memory_provider("maxmind"));
        let new = registry.insert(memory_provider("maxmind"));

        let active = registry.active().unwrap();
        assert!(Arc::ptr_eq(&active, &new));
        assert!(!Arc::ptr_eq(&active, &old));
        assert_eq!(registry.ids(), vec!["maxmind"]);
    }

    #[test]
    fn test_reload_keeps_switched_provider() {
        let registry = ProviderRegistry::new();
        registry.insert(memory_provider("maxmind"));
        let dbip = registry.insert(memory_provider("dbip"));

        registry.set_active("dbip").unwrap();
        registry.insert(memory_provider("maxmind"));

        assert!(Arc::ptr_eq(&registry.active().unwrap(), &dbip));
    }

    #[test]
    fn test_concurrent_reload_and_switch() {
        for _ in 0..50 {
            let registry = Arc::new(ProviderRegistry::new());
            registry.insert(memory_provider("maxmind"));
            registry.insert(memory_provider("dbip"));

            let reloader = {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        registry.insert(memory_provider("maxmind"));
                    }
                })
            };

            registry.set_active("dbip").unwrap();
            reloader.join().unwrap();

            assert_eq!(registry.active().unwrap().id(), "dbip");
        }
    }

    #[test]
    fn test_listing_survives_poisoned_order_lock() {
        let registry = Arc::new(ProviderRegistry::new());
        registry.insert(memory_provider("maxmind"));

        let poisoner = Arc::clone(&registry);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.order.write().unwrap();
            panic!("poison the order lock");
        })
        .join();
        assert!(registry.order.is_poisoned());

        registry.insert(memory_provider("dbip"));
        assert_eq!(registry.ids(), vec!["maxmind", "dbip"]);
        assert_eq!(registry.list().len(), 2);
    }

    #[test]
    fn test_register_missing_file() {
        let registry = ProviderRegistry::new();
        let config = ProviderConfig {
            id: "maxmind".to_string(),
            name: "MaxMind GeoLite2".to_string(),
            website: None,
            city_db: PathBuf::from("/nonexistent/GeoLite2-City.mmdb"),
            asn_db: None,
            city_url: None,
            asn_url: None,
        };

        let err = registry.register(&config).err().unwrap();
        assert!(matches!(err, GeoError::DatabaseUnavailable(_)));
        assert!(registry.is_empty());
    }
}
