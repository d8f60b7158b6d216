use crate::error::ScanError;
use ipnet::IpNet;
use std::io;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pause between DNS resolution attempts.
pub const DNS_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Default cap on hosts enumerated from a CIDR block.
pub const DEFAULT_MAX_HOSTS: usize = 254;

/// Host addresses enumerated from a CIDR block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrHosts {
    /// Usable addresses in ascending order, at most `max_hosts` of them.
    pub hosts: Vec<IpAddr>,
    /// Number of addresses in the whole block, network and broadcast included.
    pub total_addresses: u128,
    /// Set when the block is larger than `max_hosts + 2`, so `hosts` is a prefix
    /// of what the network holds. The caller decides whether to go ahead.
    pub would_truncate: bool,
}

/// True when `s` is CIDR notation (`addr/prefix`). Host bits may be set.
pub fn is_cidr(s: &str) -> bool {
    let s = s.trim();
    s.contains('/') && s.parse::<IpNet>().is_ok()
}

/// Expand a CIDR block into host addresses.
///
/// For IPv4 prefixes shorter than /31 the network and broadcast addresses are
/// excluded; /31 and /32 yield every address in the block. Enumeration stops
/// after `max_hosts` addresses.
pub fn enumerate_cidr_hosts(s: &str, max_hosts: usize) -> Result<CidrHosts, ScanError> {
    let input = s.trim();
    if !input.contains('/') {
        return Err(ScanError::Cidr {
            input: input.to_string(),
            reason: "missing prefix length".to_string(),
        });
    }
    let net: IpNet = input.parse().map_err(|e: ipnet::AddrParseError| ScanError::Cidr {
        input: input.to_string(),
        reason: e.to_string(),
    })?;

    let host_bits = u32::from(net.max_prefix_len() - net.prefix_len());
    let total_addresses = 1u128.checked_shl(host_bits).unwrap_or(u128::MAX);
    let would_truncate = total_addresses > max_hosts as u128 + 2;
    if would_truncate {
        warn!(
            network = %net.trunc(),
            total_addresses,
            max_hosts,
            "network is larger than the host limit, enumeration will be truncated"
        );
    }

    let hosts: Vec<IpAddr> = net.hosts().take(max_hosts).collect();
    debug!(network = %net.trunc(), hosts = hosts.len(), "enumerated CIDR hosts");

    Ok(CidrHosts {
        hosts,
        total_addresses,
        would_truncate,
    })
}

/// Resolve a hostname or literal address to a single IP.
///
/// Literal addresses return immediately. Otherwise up to `retries + 1` lookups
/// are made, pausing [`DNS_RETRY_DELAY`] between them. IPv4 answers are
/// preferred when a name has both families.
pub async fn resolve_host(host: &str, retries: u32) -> Result<IpAddr, ScanError> {
    let host = host.trim();
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    let attempts = retries + 1;
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses returned");
    for attempt in 1..=attempts {
        info!(host, attempt, "resolving hostname");
        match tokio::net::lookup_host((host, 0)).await {
            Ok(addrs) => {
                let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                let picked = addrs
                    .iter()
                    .copied()
                    .find(IpAddr::is_ipv4)
                    .or_else(|| addrs.first().copied());
                if let Some(ip) = picked {
                    info!(host, %ip, attempt, "resolved hostname");
                    return Ok(ip);
                }
                last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses returned");
            }
            Err(e) => {
                debug!(host, attempt, error = %e, "lookup failed");
                last_err = e;
            }
        }
        if attempt < attempts {
            tokio::time::sleep(DNS_RETRY_DELAY).await;
        }
    }

    Err(ScanError::DnsResolution {
        host: host.to_string(),
        attempts,
        source: last_err,
    })
}

/// Turn a target specification into the list of addresses to scan.
///
/// CIDR input is enumerated; a block that would be truncated is refused with
/// [`ScanError::CidrTooLarge`] unless `allow_truncate` is set, in which case the
/// first `max_hosts` addresses are scanned. Anything else is resolved as one host.
pub async fn resolve_targets(
    target: &str,
    max_hosts: usize,
    retries: u32,
    allow_truncate: bool,
) -> Result<Vec<IpAddr>, ScanError> {
    if is_cidr(target) {
        let cidr = enumerate_cidr_hosts(target, max_hosts)?;
        if cidr.would_truncate && !allow_truncate {
            return Err(ScanError::CidrTooLarge {
                total: cidr.total_addresses,
                max_hosts,
            });
        }
        return Ok(cidr.hosts);
    }
    Ok(vec![resolve_host(target, retries).await?])
}
