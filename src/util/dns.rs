//! Async name resolution with a small TTL cache.
//!
//! Resolution order matters: connect attempts walk the candidate list in the
//! order the resolver returned it, so the cache stores the full ordered list
//! rather than a single address.

use crate::util::{Result, SocksError};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use trust_dns_resolver::TokioAsyncResolver;

/// TTL for cached DNS entries.
const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// Timeout for DNS lookup operations.
const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// System-configured resolver; `None` falls back to the runtime's
/// `lookup_host`.
static RESOLVER: Lazy<Option<TokioAsyncResolver>> =
    Lazy::new(|| TokioAsyncResolver::tokio_from_system_conf().ok());

static CACHE: Lazy<RwLock<HashMap<String, CacheEntry>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

struct CacheEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

/// Resolve `host` to an ordered candidate list.
///
/// IP literals short-circuit without touching the resolver or the cache.
pub async fn resolve_target(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    if let Some(ips) = cache_get(host).await {
        trace!("[DNS] Cache hit for {} ({} addresses)", host, ips.len());
        return Ok(with_port(&ips, port));
    }

    let ips = lookup(host, port).await?;
    if ips.is_empty() {
        return Err(SocksError::Resolve(host.to_string()));
    }
    debug!("[DNS] Resolved {} to {} addresses", host, ips.len());

    cache_insert(host, ips.clone()).await;
    Ok(with_port(&ips, port))
}

async fn lookup(host: &str, port: u16) -> Result<Vec<IpAddr>> {
    if let Some(resolver) = RESOLVER.as_ref() {
        let lookup = tokio::time::timeout(DNS_TIMEOUT, resolver.lookup_ip(host))
            .await
            .map_err(|_| SocksError::Resolve(host.to_string()))?
            .map_err(|err| {
                debug!("[DNS] Lookup failed for {}: {}", host, err);
                SocksError::Resolve(host.to_string())
            })?;
        return Ok(lookup.iter().collect());
    }

    let addrs = tokio::time::timeout(DNS_TIMEOUT, lookup_host((host, port)))
        .await
        .map_err(|_| SocksError::Resolve(host.to_string()))?
        .map_err(|err| {
            debug!("[DNS] Lookup failed for {}: {}", host, err);
            SocksError::Resolve(host.to_string())
        })?;
    Ok(addrs.map(|a| a.ip()).collect())
}

async fn cache_get(host: &str) -> Option<Vec<IpAddr>> {
    let cache = CACHE.read().await;
    let entry = cache.get(host)?;
    if Instant::now() > entry.expires_at || entry.addresses.is_empty() {
        return None;
    }
    Some(entry.addresses.clone())
}

async fn cache_insert(host: &str, addresses: Vec<IpAddr>) {
    let mut cache = CACHE.write().await;
    cache.insert(
        host.to_string(),
        CacheEntry {
            addresses,
            expires_at: Instant::now() + DEFAULT_TTL,
        },
    );
}

fn with_port(ips: &[IpAddr], port: u16) -> Vec<SocketAddr> {
    ips.iter().map(|ip| SocketAddr::new(*ip, port)).collect()
}
