//! Geolocation providers and record resolution
//!
//! Providers wrap memory-mapped MaxMind-format databases (MaxMind GeoLite2,
//! DB-IP Lite). The registry owns the active provider; the resolver turns an
//! address into a normalized [`GeoRecord`].

pub mod models;
pub mod reader;
pub mod registry;
pub mod resolver;

pub use models::{AsnData, CityData, DatabaseMetadata, GeoRecord};
pub use reader::{GeoReader, MemoryReader, MmdbReader};
pub use registry::{Provider, ProviderInfo, ProviderRegistry};
pub use resolver::{parse_address, resolve, resolve_family, AddressFamily};
