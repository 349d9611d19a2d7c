//! Database readers behind the resolver
//!
//! The resolver never parses database files itself. It talks to a
//! [`GeoReader`], which is either a memory-mapped MaxMind DB file or an
//! in-memory table.

use anyhow::{Context, Result};
use maxminddb::{geoip2, Mmap, Reader};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::geo::models::{AsnData, CityData, DatabaseMetadata};

/// A source of city and ASN records.
///
/// `Ok(None)` means the address is not in the database; `Err` is reserved
/// for read failures.
pub trait GeoReader: Send + Sync {
    fn city(&self, ip: IpAddr) -> Result<Option<CityData>>;

    fn asn(&self, ip: IpAddr) -> Result<Option<AsnData>>;

    fn metadata(&self) -> DatabaseMetadata;
}

/// Memory-mapped MaxMind DB reader (GeoLite2, GeoIP2, DB-IP Lite)
pub struct MmdbReader {
    name: String,
    reader: Reader<Mmap>,
}

impl MmdbReader {
    /// Open an `.mmdb` file.
    ///
    /// The database name reported in metadata is the file stem.
    pub fn open(path: &Path) -> Result<Self> {
        let reader = unsafe { Reader::open_mmap(path) }
            .with_context(|| format!("Failed to open GeoIP database at {}", path.display()))?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self { name, reader })
    }
}

impl GeoReader for MmdbReader {
    fn city(&self, ip: IpAddr) -> Result<Option<CityData>> {
        let result = self
            .reader
            .lookup(ip)
            .with_context(|| format!("lookup of {} in {} failed", ip, self.name))?;

        // City databases are a superset of Country data, so fall back to
        // the country shape when the record has no city section.
        if let Some(city) = result.decode::<geoip2::City>()? {
            return Ok(Some(extract_from_city(&city)));
        }

        Ok(result
            .decode::<geoip2::Country>()?
            .map(|country| extract_from_country(&country)))
    }

    fn asn(&self, ip: IpAddr) -> Result<Option<AsnData>> {
        let result = self
            .reader
            .lookup(ip)
            .with_context(|| format!("lookup of {} in {} failed", ip, self.name))?;

        Ok(result.decode::<geoip2::Asn>()?.map(|asn| AsnData {
            asn: asn.autonomous_system_number,
            organization: asn.autonomous_system_organization.map(|s| s.to_string()),
        }))
    }

    fn metadata(&self) -> DatabaseMetadata {
        let meta = &self.reader.metadata;
        let node_byte_size = u64::from(meta.record_size) / 4;
        let build_date = chrono::DateTime::from_timestamp(meta.build_epoch as i64, 0)
            .map(|d| d.to_rfc3339())
            .unwrap_or_default();

        DatabaseMetadata {
            database_name: self.name.clone(),
            database_type: meta.database_type.clone(),
            record_count: u64::from(meta.node_count),
            build_date,
            description: meta
                .description
                .get("en")
                .cloned()
                .unwrap_or_else(|| "No description".to_string()),
            binary_format_major_version: meta.binary_format_major_version,
            binary_format_minor_version: meta.binary_format_minor_version,
            ip_version: meta.ip_version,
            node_byte_size,
            search_tree_size: u64::from(meta.node_count) * node_byte_size,
        }
    }
}

fn extract_from_city(city: &geoip2::City) -> CityData {
    // The most specific subdivision is the last one
    let subdivision = city.subdivisions.last();

    CityData {
        country_code: city.country.iso_code.map(|s| s.to_string()),
        country: city.country.names.english.map(|s| s.to_string()),
        region_code: subdivision.and_then(|s| s.iso_code).map(|s| s.to_string()),
        region: subdivision
            .and_then(|s| s.names.english)
            .map(|s| s.to_string()),
        city: city.city.names.english.map(|s| s.to_string()),
        postal_code: city.postal.code.map(|s| s.to_string()),
        continent_code: city.continent.code.map(|s| s.to_string()),
        latitude: city.location.latitude,
        longitude: city.location.longitude,
        timezone: city.location.time_zone.map(|s| s.to_string()),
        organization: None,
    }
}

fn extract_from_country(country: &geoip2::Country) -> CityData {
    CityData {
        country_code: country.country.iso_code.map(|s| s.to_string()),
        country: country.country.names.english.map(|s| s.to_string()),
        continent_code: country.continent.code.map(|s| s.to_string()),
        ..Default::default()
    }
}

/// In-memory reader keyed by exact address.
///
/// Counts every lookup so callers can observe whether the cache short-circuited
/// a read.
#[derive(Default)]
pub struct MemoryReader {
    metadata: DatabaseMetadata,
    cities: HashMap<IpAddr, CityData>,
    asns: HashMap<IpAddr, AsnData>,
    failing: bool,
    lookups: AtomicUsize,
}

impl MemoryReader {
    pub fn new(name: &str) -> Self {
        Self {
            metadata: DatabaseMetadata {
                database_name: name.to_string(),
                database_type: name.to_string(),
                description: format!("In-memory {} table", name),
                ip_version: 6,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_city(mut self, ip: IpAddr, data: CityData) -> Self {
        self.cities.insert(ip, data);
        self.metadata.record_count = (self.cities.len() + self.asns.len()) as u64;
        self
    }

    pub fn with_asn(mut self, ip: IpAddr, data: AsnData) -> Self {
        self.asns.insert(ip, data);
        self.metadata.record_count = (self.cities.len() + self.asns.len()) as u64;
        self
    }

    /// Make every lookup fail as if the file were unreadable
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Number of lookups served so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn record_lookup(&self, ip: IpAddr) -> Result<()> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            anyhow::bail!("read error in {} for {}", self.metadata.database_name, ip);
        }
        Ok(())
    }
}

impl GeoReader for MemoryReader {
    fn city(&self, ip: IpAddr) -> Result<Option<CityData>> {
        self.record_lookup(ip)?;
        Ok(self.cities.get(&ip).cloned())
    }

    fn asn(&self, ip: IpAddr) -> Result<Option<AsnData>> {
        self.record_lookup(ip)?;
        Ok(self.asns.get(&ip).cloned())
    }

    fn metadata(&self) -> DatabaseMetadata {
        self.metadata.clone()
    }
}
