//! Client address resolution with proxy trust validation
//!
//! The socket peer is authoritative unless a trusted proxy mode is
//! configured:
//! - `standard` reads `Forwarded` (RFC 7239) then `X-Forwarded-For`,
//!   walking the chain right to left past trusted hops
//! - `cloudflare` reads `CF-Connecting-IP`

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{request::Parts, Extensions, HeaderMap},
};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

use crate::config::{ClientIpConfig, TrustedProxyMode};

use super::AppState;

/// The caller's address as seen through any trusted proxies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Extract the client IP address from HTTP headers
///
/// # Arguments
/// * `headers` - HTTP request headers
/// * `socket_addr` - Peer address of the connection
/// * `config` - Which forwarding headers to honour and which proxies to trust
///
/// # Returns
/// The client address, or `socket_addr` whenever the headers are absent or
/// not trusted
pub fn extract_client_ip(headers: &HeaderMap, socket_addr: IpAddr, config: &ClientIpConfig) -> IpAddr {
    match config.trusted_proxy_mode {
        TrustedProxyMode::Cloudflare => extract_cloudflare_ip(headers).unwrap_or_else(|| {
            warn!("CF-Connecting-IP header missing in Cloudflare mode, using socket address");
            socket_addr
        }),
        TrustedProxyMode::Standard => extract_standard_ip(headers, config).unwrap_or(socket_addr),
        TrustedProxyMode::None => socket_addr,
    }
}

/// Peer address recorded by `into_make_service_with_connect_info`
pub fn peer_addr(extensions: &Extensions) -> IpAddr {
    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Resolve the client address for a request, reusing an earlier result
pub fn resolve(headers: &HeaderMap, extensions: &Extensions, config: &ClientIpConfig) -> ClientIp {
    if let Some(ip) = extensions.get::<ClientIp>() {
        return *ip;
    }
    ClientIp(extract_client_ip(headers, peer_addr(extensions), config))
}

impl FromRequestParts<Arc<AppState>> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(resolve(&parts.headers, &parts.extensions, &state.client_ip))
    }
}

fn extract_cloudflare_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("cf-connecting-ip")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
}

fn extract_standard_ip(headers: &HeaderMap, config: &ClientIpConfig) -> Option<IpAddr> {
    // Prefer RFC 7239 Forwarded header
    let forwarded = forwarded_chain(headers);
    if !forwarded.is_empty() {
        return select_from_chain(&forwarded, config);
    }

    let xff = x_forwarded_for_chain(headers);
    if !xff.is_empty() {
        return select_from_chain(&xff, config);
    }

    None
}

/// `for=` addresses of every Forwarded element, left to right
fn forwarded_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    headers
        .get_all("forwarded")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|element| {
            element.split(';').find_map(|param| {
                let (name, value) = param.trim().split_once('=')?;
                if name.eq_ignore_ascii_case("for") {
                    parse_node(value)
                } else {
                    None
                }
            })
        })
        .collect()
}

/// Parse a Forwarded node: `192.0.2.60`, `"192.0.2.60:4711"`,
/// `"[2001:db8::1]:4711"`
fn parse_node(value: &str) -> Option<IpAddr> {
    let value = value.trim().trim_matches('"');

    if let Some(rest) = value.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }

    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }

    // IPv4 with port
    let (host, _port) = value.rsplit_once(':')?;
    host.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
}

fn x_forwarded_for_chain(headers: &HeaderMap) -> Vec<IpAddr> {
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|s| s.trim().parse::<IpAddr>().ok())
        .collect()
}

/// Pick the client from a left-to-right proxy chain
fn select_from_chain(ips: &[IpAddr], config: &ClientIpConfig) -> Option<IpAddr> {
    if let Some(num_trusted) = config.num_trusted_proxies {
        if ips.len() > num_trusted {
            return Some(ips[ips.len() - num_trusted - 1]);
        }
        // Not enough hops in the chain, return the leftmost (least trusted)
        return ips.first().copied();
    }

    if !config.trusted_proxies.is_empty() {
        // First address from the right that is not one of our proxies
        return ips
            .iter()
            .rev()
            .find(|ip| !config.trusted_proxies.iter().any(|net| net.contains(*ip)))
            .or_else(|| ips.first())
            .copied();
    }

    ips.last().copied()
}
