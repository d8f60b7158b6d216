//! Library crate for portprobe: port/host parsing, probe execution and scan orchestration.
pub mod banner;
pub mod config;
pub mod error;
pub mod hosts;
pub mod packet;
pub mod ports;
pub mod probe;
pub mod raw;
pub mod scanner;
pub mod services;
pub mod types;

pub use config::ScanConfig;
pub use error::ScanError;
pub use hosts::{enumerate_cidr_hosts, is_cidr, resolve_host, resolve_targets};
pub use ports::{parse_ports, validate_ports};
pub use scanner::{cancel, run_scan, ScanHandle, ScanObserver, ScanOptions};
pub use types::{PortStatus, Protocol, ProtocolMode, ScanMethod, ScanReport, ScanResult, ScanTask};
