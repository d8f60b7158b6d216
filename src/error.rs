use thiserror::Error;

/// Errors raised while setting up a scan session.
///
/// These are reported once, synchronously, before any probe runs. Failures of
/// individual probes never surface here; they become `PortStatus::Error` rows.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("the following ports are invalid: {ports:?} (valid port range: 0-65535)")]
    InvalidPorts { ports: Vec<u64> },

    #[error("no ports to scan")]
    EmptyPortSpec,

    #[error("could not resolve host {host} after {attempts} attempt(s): {source}")]
    DnsResolution {
        host: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid network {input}: {reason}")]
    Cidr { input: String, reason: String },

    #[error("network has {total} addresses, more than the limit of {max_hosts} hosts")]
    CidrTooLarge { total: u128, max_hosts: usize },

    #[error("fragmented scanning unavailable: {0}")]
    FragmentedUnavailable(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}
