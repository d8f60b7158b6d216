use crate::banner;
use crate::raw;
use crate::services::service_name;
use crate::types::{PortStatus, Protocol, ScanMethod, ScanResult, ScanTask};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{self, Instant};
use tracing::debug;

/// Smallest read window handed to the banner grabber when the connect used
/// up most of the timeout.
const MIN_BANNER_BUDGET: Duration = Duration::from_millis(50);

/// Executes a single scan task. The orchestrator only talks to this trait.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, task: &ScanTask) -> Result<ScanResult>;
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub banner_grabbing: bool,
}

/// Real network prober with the two-tier strategy: a fragmented raw probe
/// for tasks that ask for it, falling back to the standard probe whenever the
/// raw path cannot be used.
#[derive(Debug, Clone, Copy)]
pub struct NetworkProber {
    settings: ProbeSettings,
}

impl NetworkProber {
    pub fn new(settings: ProbeSettings) -> Self {
        Self { settings }
    }

    async fn standard(&self, task: &ScanTask) -> Result<ScanResult> {
        match task.protocol {
            Protocol::Tcp => tcp_connect_probe(task, self.settings).await,
            Protocol::Udp => udp_probe(task, self.settings.timeout).await,
        }
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, task: &ScanTask) -> Result<ScanResult> {
        if task.method == ScanMethod::Fragmented {
            match raw::fragmented_probe(task, self.settings.timeout).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!(
                        target = %task.host,
                        port = task.port,
                        error = %e,
                        "fragmented probe failed, using standard probe"
                    );
                }
            }
        }
        self.standard(task).await
    }
}

/// Full TCP connect. Refused or timed-out connects are `Closed`; any other
/// socket error is returned to the caller.
pub async fn tcp_connect_probe(task: &ScanTask, settings: ProbeSettings) -> Result<ScanResult> {
    let addr = SocketAddr::new(task.host, task.port);
    let service = service_name(task.port, Protocol::Tcp);
    let start = Instant::now();

    let connect_res = time::timeout(settings.timeout, TcpStream::connect(addr)).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let mut stream = match connect_res {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            return Ok(closed(task, service, elapsed_ms));
        }
        Err(_) => return Ok(closed(task, service, elapsed_ms)),
        Ok(Err(e)) => return Err(e).with_context(|| format!("connect to {addr} failed")),
    };

    let banner = if settings.banner_grabbing {
        let budget = settings
            .timeout
            .saturating_sub(start.elapsed())
            .max(MIN_BANNER_BUDGET);
        Some(banner::grab_banner(&mut stream, task.host, task.port, budget).await)
    } else {
        None
    };

    Ok(ScanResult::new(
        task,
        ScanMethod::Standard,
        PortStatus::Open,
        service,
        banner,
        elapsed_ms,
    ))
}

/// UDP probe. Any datagram back from the target means `Open`; silence until
/// the timeout means `OpenFiltered`, which covers both a silent open service
/// and a filtered port. ICMP errors are not interpreted.
pub async fn udp_probe(task: &ScanTask, timeout: Duration) -> Result<ScanResult> {
    let target = SocketAddr::new(task.host, task.port);
    let bind_addr = match task.host {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    };
    // Left unconnected so the kernel does not surface ICMP errors on recv.
    let socket = UdpSocket::bind(bind_addr)
        .await
        .context("failed to bind UDP socket")?;

    let start = Instant::now();
    socket
        .send_to(udp_payload_for_port(task.port), target)
        .await
        .with_context(|| format!("failed to send UDP probe to {target}"))?;

    let deadline = start + timeout;
    let mut buf = [0u8; 512];
    let status = loop {
        match time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break PortStatus::OpenFiltered,
            Ok(Ok((_, from))) if from.ip() == task.host => break PortStatus::Open,
            Ok(Ok(_)) => continue,
            // Some platforms still report ICMP unreachable on unconnected sockets.
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                ) =>
            {
                break PortStatus::OpenFiltered
            }
            Ok(Err(e)) => return Err(e).context("UDP receive failed"),
        }
    };
    let elapsed_ms = match status {
        PortStatus::Open => start.elapsed().as_millis() as u64,
        _ => 0,
    };

    Ok(ScanResult::new(
        task,
        ScanMethod::Standard,
        status,
        service_name(task.port, Protocol::Udp),
        None,
        elapsed_ms,
    ))
}

/// Datagram that a service on `port` is likely to answer. Empty for unknown ports.
pub fn udp_payload_for_port(port: u16) -> &'static [u8] {
    const DNS_ROOT_NS_QUERY: &[u8] = &[
        0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // header
        0x00, // root name
        0x00, 0x02, 0x00, 0x01, // NS, IN
    ];
    const NTP_CLIENT_REQUEST: [u8; 48] = {
        let mut req = [0u8; 48];
        req[0] = 0x1b; // LI 0, version 3, mode client
        req
    };
    // SNMPv1 get-request, community "public", OID sysDescr.0
    const SNMP_GET_SYSDESCR: &[u8] = &[
        0x30, 0x29, 0x02, 0x01, 0x00, 0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', 0xa0, 0x1c,
        0x02, 0x04, 0x12, 0x34, 0x56, 0x78, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00, 0x30, 0x0e, 0x30,
        0x0c, 0x06, 0x08, 0x2b, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, 0x05, 0x00,
    ];

    match port {
        53 => DNS_ROOT_NS_QUERY,
        123 => &NTP_CLIENT_REQUEST,
        161 => SNMP_GET_SYSDESCR,
        _ => &[],
    }
}

fn closed(task: &ScanTask, service: &str, elapsed_ms: u64) -> ScanResult {
    ScanResult::new(task, ScanMethod::Standard, PortStatus::Closed, service, None, elapsed_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_payloads_are_well_formed() {
        assert_eq!(udp_payload_for_port(123).len(), 48);
        let snmp = udp_payload_for_port(161);
        assert_eq!(snmp.len(), usize::from(snmp[1]) + 2);
        assert_eq!(udp_payload_for_port(53)[5], 1);
        assert!(udp_payload_for_port(9999).is_empty());
    }
}
