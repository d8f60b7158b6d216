use ::time::{format_description::well_known, OffsetDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Transport protocol of a single probe.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// Which protocols a session probes for every (host, port) pair.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolMode {
    #[default]
    Tcp,
    Udp,
    Both,
}

impl ProtocolMode {
    pub fn protocols(self) -> &'static [Protocol] {
        match self {
            ProtocolMode::Tcp => &[Protocol::Tcp],
            ProtocolMode::Udp => &[Protocol::Udp],
            ProtocolMode::Both => &[Protocol::Tcp, Protocol::Udp],
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScanMethod {
    Standard,
    Fragmented,
}

impl fmt::Display for ScanMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMethod::Standard => f.write_str("standard"),
            ScanMethod::Fragmented => f.write_str("fragmented"),
        }
    }
}

/// Reachability verdict for one probe.
///
/// `OpenFiltered` is the UDP "no reply" outcome: the method cannot tell an
/// open, silent service from a filtered port. `Filtered` is only produced by
/// fragmented TCP probes that receive nothing.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortStatus {
    Open,
    Closed,
    OpenFiltered,
    Filtered,
    Error,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortStatus::Open => "OPEN",
            PortStatus::Closed => "CLOSED",
            PortStatus::OpenFiltered => "OPEN|FILTERED",
            PortStatus::Filtered => "FILTERED",
            PortStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One unit of scheduled work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTask {
    pub host: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub method: ScanMethod,
}

/// Outcome of one completed task. Built once and never mutated afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub host: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub status: PortStatus,
    pub service: String,
    pub banner: Option<String>,
    /// Milliseconds spent on the probe; 0 means unmeasured.
    pub response_time_ms: u64,
    pub scan_method: ScanMethod,
    pub timestamp: String,
}

impl ScanResult {
    pub fn new(
        task: &ScanTask,
        method: ScanMethod,
        status: PortStatus,
        service: impl Into<String>,
        banner: Option<String>,
        response_time_ms: u64,
    ) -> Self {
        Self {
            host: task.host,
            port: task.port,
            protocol: task.protocol,
            status,
            service: service.into(),
            banner,
            response_time_ms,
            scan_method: method,
            timestamp: now_iso_like(),
        }
    }

    /// A row for a probe that failed; the diagnostic goes in the banner field.
    pub fn error(task: &ScanTask, diagnostic: impl Into<String>) -> Self {
        Self::new(
            task,
            task.method,
            PortStatus::Error,
            "Error",
            Some(diagnostic.into()),
            0,
        )
    }

    pub fn is_open(&self) -> bool {
        self.status == PortStatus::Open
    }
}

/// Final aggregation of a session, built exactly once.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ScanReport {
    pub total_scans: u64,
    pub completed: u64,
    pub open_count: u64,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    pub show_open_only: bool,
    /// Every result the session produced, in completion order.
    pub results: Vec<ScanResult>,
}

impl ScanReport {
    /// Results to display: only open ports when `show_open_only` is set.
    pub fn presentable(&self) -> Vec<&ScanResult> {
        self.results
            .iter()
            .filter(|r| !self.show_open_only || r.is_open())
            .collect()
    }
}

pub(crate) fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn task(port: u16) -> ScanTask {
        ScanTask {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            protocol: Protocol::Tcp,
            method: ScanMethod::Standard,
        }
    }

    #[test]
    fn both_mode_yields_two_protocols() {
        assert_eq!(ProtocolMode::Both.protocols(), &[Protocol::Tcp, Protocol::Udp]);
        assert_eq!(ProtocolMode::Udp.protocols(), &[Protocol::Udp]);
    }

    #[test]
    fn presentable_respects_open_only() {
        let t = task(22);
        let mut report = ScanReport {
            results: vec![
                ScanResult::new(&t, ScanMethod::Standard, PortStatus::Open, "ssh", None, 1),
                ScanResult::new(
                    &task(23),
                    ScanMethod::Standard,
                    PortStatus::Closed,
                    "telnet",
                    None,
                    1,
                ),
            ],
            ..Default::default()
        };
        assert_eq!(report.presentable().len(), 2);
        report.show_open_only = true;
        let shown = report.presentable();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].port, 22);
    }

    #[test]
    fn error_row_carries_diagnostic() {
        let r = ScanResult::error(&task(80), "boom");
        assert_eq!(r.status, PortStatus::Error);
        assert_eq!(r.banner.as_deref(), Some("boom"));
        assert_eq!(r.response_time_ms, 0);
    }

    #[test]
    fn status_serializes_screaming_case() {
        let s = serde_json::to_string(&PortStatus::OpenFiltered).unwrap();
        assert_eq!(s, "\"OPEN_FILTERED\"");
    }
}
