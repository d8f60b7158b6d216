use crate::error::ScanError;
use std::collections::HashSet;
use std::num::IntErrorKind;

/// Highest valid TCP/UDP port number.
pub const MAX_PORT: u64 = 65_535;

/// Parse a port specification into an ordered, deduplicated list of port numbers.
///
/// Supported tokens, separated by commas:
/// - single port number: `80`
/// - inclusive range: `8000-8010` (a reversed range such as `10-5` contributes nothing)
///
/// Whitespace around tokens is ignored. Tokens that are not integers are skipped,
/// so parsing never fails. The first occurrence of a port fixes its position.
/// Values above 65535 are kept here and rejected by [`validate_ports`]; a range
/// reaching past 65535 keeps only the endpoints of its out-of-range part.
/// Numbers too large for `u64` are kept as `u64::MAX`.
pub fn parse_ports(s: &str) -> Vec<u64> {
    let mut out: Vec<u64> = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |p: u64| {
        if seen.insert(p) {
            out.push(p);
        }
    };

    for raw in s.split(',') {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }

        if token.contains('-') {
            let Some((start, end)) = parse_range(token) else {
                continue;
            };
            if start <= MAX_PORT {
                for p in start..=end.min(MAX_PORT) {
                    push(p);
                }
            }
            if end > MAX_PORT {
                push(start.max(MAX_PORT + 1));
                push(end);
            }
            continue;
        }

        if let Some(p) = parse_number(token) {
            push(p);
        }
    }

    out
}

/// Check every parsed value against the valid port range.
///
/// All offenders are reported together in a single error.
pub fn validate_ports(ports: &[u64]) -> Result<Vec<u16>, ScanError> {
    let invalid: Vec<u64> = ports.iter().copied().filter(|&p| p > MAX_PORT).collect();
    if !invalid.is_empty() {
        return Err(ScanError::InvalidPorts { ports: invalid });
    }
    Ok(ports.iter().map(|&p| p as u16).collect())
}

/// Parse and validate in one step, rejecting a specification that yields no ports.
pub fn parse_port_spec(s: &str) -> Result<Vec<u16>, ScanError> {
    let ports = validate_ports(&parse_ports(s))?;
    if ports.is_empty() {
        return Err(ScanError::EmptyPortSpec);
    }
    Ok(ports)
}

/// A conservative default list of commonly used ports.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 67, 68, 69, 80, 110, 123, 135, 137, 138, 139, 143, 161, 389, 443, 445,
        465, 500, 514, 587, 631, 993, 995, 1025, 1433, 1521, 1723, 1883, 2049, 2375, 2380, 3000,
        3128, 3260, 3306, 3389, 4369, 5000, 5040, 5432, 5672, 5900, 5985, 5986, 6379, 7001, 7002,
        8000, 8008, 8080, 8081, 8088, 8443, 8500, 8888, 9000, 9092, 9200, 9300, 11211, 27017,
    ];
    DEFAULT.to_vec()
}

// `start-end` with exactly two integer ends. Reversed ranges yield an empty range.
fn parse_range(token: &str) -> Option<(u64, u64)> {
    let mut parts = token.split('-');
    let start = parse_number(parts.next()?.trim())?;
    let end = parse_number(parts.next()?.trim())?;
    if parts.next().is_some() {
        return None;
    }
    if start > end {
        return Some((1, 0));
    }
    Some((start, end))
}

// Overflow saturates so the value still fails validation.
fn parse_number(token: &str) -> Option<u64> {
    match token.parse::<u64>() {
        Ok(n) => Some(n),
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => Some(u64::MAX),
        Err(_) => None,
    }
}
