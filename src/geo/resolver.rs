//! Address validation and record resolution against a provider

use std::net::IpAddr;
use tracing::warn;

use crate::error::{GeoError, GeoResult};
use crate::geo::models::GeoRecord;
use crate::geo::registry::Provider;

/// Address family accepted by a lookup endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Any,
    V4,
    V6,
}

impl AddressFamily {
    fn label(self) -> &'static str {
        match self {
            AddressFamily::Any => "IP",
            AddressFamily::V4 => "IPv4",
            AddressFamily::V6 => "IPv6",
        }
    }
}

/// Parse `ip` and check it against `family`.
///
/// Runs before any reader is consulted.
pub fn parse_address(ip: &str, family: AddressFamily) -> GeoResult<IpAddr> {
    let trimmed = ip.trim();
    let addr: IpAddr = trimmed
        .parse()
        .map_err(|_| GeoError::InvalidAddress(trimmed.to_string()))?;

    let matches = match family {
        AddressFamily::Any => true,
        AddressFamily::V4 => addr.is_ipv4(),
        AddressFamily::V6 => addr.is_ipv6(),
    };

    if matches {
        Ok(addr)
    } else {
        Err(GeoError::WrongAddressFamily {
            ip: trimmed.to_string(),
            family: family.label(),
        })
    }
}

/// Resolve `ip` through `provider`, accepting either family
pub fn resolve(provider: &Provider, ip: &str) -> GeoResult<GeoRecord> {
    resolve_family(provider, ip, AddressFamily::Any)
}

/// Resolve `ip` through `provider`, merging ASN data when the provider has
/// an ASN reader.
pub fn resolve_family(provider: &Provider, ip: &str, family: AddressFamily) -> GeoResult<GeoRecord> {
    let addr = parse_address(ip, family)?;
    lookup(provider, ip.trim(), addr)
}

/// Resolve an address that has already been validated
pub(crate) fn lookup(provider: &Provider, ip: &str, addr: IpAddr) -> GeoResult<GeoRecord> {
    let city = provider
        .city_reader()
        .city(addr)
        .map_err(|e| GeoError::Lookup(format!("{:#}", e)))?
        .ok_or_else(|| GeoError::AddressNotFound(ip.to_string()))?;

    let mut record = GeoRecord::from_city(ip, city);

    if let Some(asn_reader) = provider.asn_reader() {
        match asn_reader.asn(addr) {
            Ok(Some(asn)) => record.merge_asn(asn),
            Ok(None) => {}
            Err(e) => {
                warn!(provider = provider.id(), ip = %addr, error = %e, "ASN lookup failed, omitting ASN fields");
            }
        }
    }

    Ok(record)
}
