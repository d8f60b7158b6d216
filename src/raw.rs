//! Fragmented probing over raw sockets.
//!
//! Needs root or CAP_NET_RAW. Every failure here is reported to the caller,
//! which falls back to the standard probe for that task.

use crate::error::ScanError;
use crate::services::service_name;
use crate::types::{ScanMethod, ScanResult, ScanTask};
use anyhow::{anyhow, Result};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::time::Duration;

/// Gap between the two fragments so they leave in order.
pub const INTER_FRAGMENT_DELAY: Duration = Duration::from_millis(1);

/// Check once whether this process may open raw IPv4 sockets.
pub fn check_raw_capability() -> Result<(), ScanError> {
    Socket::new(Domain::IPV4, Type::RAW, Some(SockProtocol::TCP))
        .map(drop)
        .map_err(|e| ScanError::FragmentedUnavailable(format!("cannot open raw socket: {e}")))
}

/// Send the task's probe as two IP fragments and classify the reply.
pub async fn fragmented_probe(task: &ScanTask, timeout: Duration) -> Result<ScanResult> {
    let task = *task;
    let (status, elapsed_ms) =
        tokio::task::spawn_blocking(move || imp::probe_blocking(&task, timeout))
            .await
            .map_err(|e| anyhow!("fragmented probe task failed: {e}"))??;

    Ok(ScanResult::new(
        &task,
        ScanMethod::Fragmented,
        status,
        service_name(task.port, task.protocol),
        None,
        elapsed_ms,
    ))
}

#[cfg(unix)]
mod imp {
    use crate::packet::{build_tcp_syn, build_udp, fragment_pair};
    use crate::probe::udp_payload_for_port;
    use crate::types::{PortStatus, Protocol, ScanTask};
    use anyhow::{anyhow, bail, Context, Result};
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::packet::ipv4::Ipv4Packet;
    use pnet::packet::tcp::TcpFlags;
    use pnet::transport::{
        tcp_packet_iter, transport_channel, udp_packet_iter, TransportChannelType,
        TransportProtocol, TransportReceiver,
    };
    use rand::Rng;
    use std::net::{IpAddr, Ipv4Addr, UdpSocket};
    use std::thread;
    use std::time::{Duration, Instant};
    use tracing::{debug, trace};

    use super::INTER_FRAGMENT_DELAY;

    const CHANNEL_BUFFER: usize = 4096;
    // A UDP probe with no natural payload still needs bytes past the split point.
    static UDP_FILLER: [u8; 8] = [0u8; 8];

    pub(super) fn probe_blocking(task: &ScanTask, timeout: Duration) -> Result<(PortStatus, u64)> {
        let IpAddr::V4(dst) = task.host else {
            bail!("fragmented probing supports IPv4 targets only");
        };
        let src = local_ipv4_for(dst)?;

        let mut rng = rand::thread_rng();
        let src_port: u16 = rng.gen_range(49152..=65535);
        let identification: u16 = rng.gen();

        let (protocol, segment) = match task.protocol {
            Protocol::Tcp => (
                IpNextHeaderProtocols::Tcp,
                build_tcp_syn(src, dst, src_port, task.port, rng.gen())?,
            ),
            Protocol::Udp => {
                let payload = match udp_payload_for_port(task.port) {
                    [] => &UDP_FILLER[..],
                    p => p,
                };
                (
                    IpNextHeaderProtocols::Udp,
                    build_udp(src, dst, src_port, task.port, payload)?,
                )
            }
        };
        let [first, second] = fragment_pair(src, dst, identification, protocol, &segment)?;

        // Listen before sending so a fast reply is not missed.
        let (_, mut rx) =
            open_channel(TransportChannelType::Layer4(TransportProtocol::Ipv4(protocol)))?;
        let (mut tx, _) = open_channel(TransportChannelType::Layer3(protocol))?;

        let start = Instant::now();
        send_fragment(&mut tx, &first, dst)?;
        thread::sleep(INTER_FRAGMENT_DELAY);
        send_fragment(&mut tx, &second, dst)?;
        trace!(target = %dst, port = task.port, src_port, identification, "sent fragment pair");

        let deadline = start + timeout;
        let status = match task.protocol {
            Protocol::Tcp => await_tcp_reply(&mut rx, dst, task.port, src_port, deadline)?,
            Protocol::Udp => await_udp_reply(&mut rx, dst, task.port, src_port, deadline)?,
        };
        let elapsed_ms = match status {
            PortStatus::Filtered | PortStatus::OpenFiltered => 0,
            _ => start.elapsed().as_millis() as u64,
        };
        debug!(target = %dst, port = task.port, %status, "fragmented probe finished");
        Ok((status, elapsed_ms))
    }

    fn open_channel(
        kind: TransportChannelType,
    ) -> Result<(pnet::transport::TransportSender, TransportReceiver)> {
        transport_channel(CHANNEL_BUFFER, kind).context("failed to open raw channel")
    }

    fn send_fragment(
        tx: &mut pnet::transport::TransportSender,
        fragment: &[u8],
        dst: Ipv4Addr,
    ) -> Result<()> {
        let packet = Ipv4Packet::new(fragment).ok_or_else(|| anyhow!("malformed fragment"))?;
        tx.send_to(packet, IpAddr::V4(dst))
            .context("failed to send fragment")?;
        Ok(())
    }

    fn await_tcp_reply(
        rx: &mut TransportReceiver,
        dst: Ipv4Addr,
        port: u16,
        src_port: u16,
        deadline: Instant,
    ) -> Result<PortStatus> {
        let mut iter = tcp_packet_iter(rx);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(PortStatus::Filtered);
            }
            let Some((packet, addr)) = iter.next_with_timeout(remaining)? else {
                return Ok(PortStatus::Filtered);
            };
            if addr != IpAddr::V4(dst)
                || packet.get_source() != port
                || packet.get_destination() != src_port
            {
                continue;
            }
            let flags = u16::from(packet.get_flags());
            if has_flag(flags, TcpFlags::SYN) && has_flag(flags, TcpFlags::ACK) {
                return Ok(PortStatus::Open);
            }
            if has_flag(flags, TcpFlags::RST) {
                return Ok(PortStatus::Closed);
            }
        }
    }

    fn await_udp_reply(
        rx: &mut TransportReceiver,
        dst: Ipv4Addr,
        port: u16,
        src_port: u16,
        deadline: Instant,
    ) -> Result<PortStatus> {
        let mut iter = udp_packet_iter(rx);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(PortStatus::OpenFiltered);
            }
            let Some((packet, addr)) = iter.next_with_timeout(remaining)? else {
                return Ok(PortStatus::OpenFiltered);
            };
            if addr == IpAddr::V4(dst)
                && packet.get_source() == port
                && packet.get_destination() == src_port
            {
                return Ok(PortStatus::Open);
            }
        }
    }

    fn has_flag<F: Into<u16>>(flags: u16, flag: F) -> bool {
        flags & flag.into() != 0
    }

    // Source address the kernel would route `dst` through. Connecting a UDP
    // socket sends nothing.
    fn local_ipv4_for(dst: Ipv4Addr) -> Result<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .context("failed to bind route probe socket")?;
        socket
            .connect((dst, 9))
            .with_context(|| format!("no route to {dst}"))?;
        match socket.local_addr()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            other => Err(anyhow!("unusable local address {other} for {dst}")),
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use crate::types::{PortStatus, ScanTask};
    use anyhow::{bail, Result};
    use std::time::Duration;

    pub(super) fn probe_blocking(
        _task: &ScanTask,
        _timeout: Duration,
    ) -> Result<(PortStatus, u64)> {
        bail!("fragmented probing is not supported on this platform")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_capability_check_reports_a_typed_error() {
        match check_raw_capability() {
            Ok(()) => {}
            Err(ScanError::FragmentedUnavailable(reason)) => {
                assert!(reason.contains("raw socket"))
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
