//! Data models for geolocation lookups

use serde::{Deserialize, Serialize};

/// Normalized geolocation record returned to clients.
///
/// Field order is the wire order for every output format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoRecord {
    /// The queried address, exactly as supplied
    pub ip: String,

    /// ISO country code (e.g., "US", "GB")
    pub country_code: Option<String>,

    /// Country name
    pub country: Option<String>,

    /// ISO code of the most specific subdivision
    pub region_code: Option<String>,

    /// Name of the most specific subdivision
    pub region: Option<String>,

    pub city: Option<String>,

    pub postal_code: Option<String>,

    pub continent_code: Option<String>,

    pub latitude: Option<f64>,

    pub longitude: Option<f64>,

    pub organization: Option<String>,

    /// Autonomous System Number
    pub asn: Option<u32>,

    /// ASN organization name
    pub asn_organization: Option<String>,

    pub isp: Option<String>,

    /// IANA time zone (e.g., "America/Chicago")
    pub timezone: Option<String>,
}

/// City/region data produced by a primary reader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CityData {
    pub country_code: Option<String>,
    pub country: Option<String>,
    pub region_code: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub continent_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
    /// Organization from the primary database, when it carries one
    pub organization: Option<String>,
}

/// Autonomous system data produced by an ASN reader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsnData {
    pub asn: Option<u32>,
    pub organization: Option<String>,
}

/// Descriptive statistics for one database file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseMetadata {
    pub database_name: String,
    pub database_type: String,
    /// Number of nodes in the search tree
    pub record_count: u64,
    /// Build time as RFC 3339
    pub build_date: String,
    pub description: String,
    pub binary_format_major_version: u16,
    pub binary_format_minor_version: u16,
    pub ip_version: u16,
    pub node_byte_size: u64,
    pub search_tree_size: u64,
}

impl GeoRecord {
    /// Merge city data into a record for `ip`.
    ///
    /// Coordinates are kept only as a pair.
    pub fn from_city(ip: impl Into<String>, city: CityData) -> Self {
        let (latitude, longitude) = match (city.latitude, city.longitude) {
            (Some(lat), Some(lon)) => (Some(lat), Some(lon)),
            _ => (None, None),
        };

        Self {
            ip: ip.into(),
            country_code: city.country_code,
            country: city.country,
            region_code: city.region_code,
            region: city.region,
            city: city.city,
            postal_code: city.postal_code,
            continent_code: city.continent_code,
            latitude,
            longitude,
            organization: city.organization,
            asn: None,
            asn_organization: None,
            isp: None,
            timezone: city.timezone,
        }
    }

    /// Apply ASN data. The ASN organization wins over any organization
    /// supplied by the primary database.
    pub fn merge_asn(&mut self, asn: AsnData) {
        self.asn = asn.asn;
        if let Some(org) = asn.organization {
            self.organization = Some(org.clone());
            self.isp = Some(org.clone());
            self.asn_organization = Some(org);
        }
    }
}
