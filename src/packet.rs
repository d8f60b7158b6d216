//! IPv4/TCP/UDP packet construction for fragmented probing.
//!
//! Everything here is pure: buffers in, buffers out. Sending lives in `raw`.

use anyhow::{anyhow, bail, Result};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::{Ipv4Flags, MutableIpv4Packet};
use pnet::packet::tcp::{MutableTcpPacket, TcpFlags};
use pnet::packet::udp::MutableUdpPacket;
use std::net::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// Transport bytes carried by the first fragment. For TCP this ends right after
/// the sequence number, so the flags byte only appears in the second fragment.
pub const FRAGMENT_SPLIT: usize = 8;

const DEFAULT_TTL: u8 = 64;
const SYN_WINDOW: u16 = 1024;

/// Internet checksum (RFC 1071): one's complement of the one's complement sum
/// of 16-bit big-endian words. An odd trailing byte is padded with zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of a TCP segment or UDP datagram including the IPv4 pseudo-header.
/// The checksum field inside `segment` must be zero.
pub fn transport_checksum(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: IpNextHeaderProtocol,
    segment: &[u8],
) -> u16 {
    let mut buf = Vec::with_capacity(12 + segment.len());
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.push(0);
    buf.push(protocol.0);
    buf.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    buf.extend_from_slice(segment);
    internet_checksum(&buf)
}

/// A 20-byte TCP header with only SYN set, checksum filled in.
pub fn build_tcp_syn(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; TCP_HEADER_LEN];
    {
        let mut tcp = MutableTcpPacket::new(&mut buf)
            .ok_or_else(|| anyhow!("buffer too small for TCP header"))?;
        tcp.set_source(src_port);
        tcp.set_destination(dst_port);
        tcp.set_sequence(seq);
        tcp.set_acknowledgement(0);
        tcp.set_data_offset((TCP_HEADER_LEN / 4) as u8);
        tcp.set_flags(TcpFlags::SYN.into());
        tcp.set_window(SYN_WINDOW);
        tcp.set_urgent_ptr(0);
        tcp.set_checksum(0);
    }
    let checksum = transport_checksum(src, dst, IpNextHeaderProtocols::Tcp, &buf);
    buf[16..18].copy_from_slice(&checksum.to_be_bytes());
    Ok(buf)
}

/// A UDP datagram carrying `payload`, checksum filled in.
pub fn build_udp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let len = UDP_HEADER_LEN + payload.len();
    if len > usize::from(u16::MAX) - IPV4_HEADER_LEN {
        bail!("UDP payload of {} bytes is too large", payload.len());
    }
    let mut buf = vec![0u8; len];
    {
        let mut udp = MutableUdpPacket::new(&mut buf)
            .ok_or_else(|| anyhow!("buffer too small for UDP header"))?;
        udp.set_source(src_port);
        udp.set_destination(dst_port);
        udp.set_length(len as u16);
        udp.set_checksum(0);
        udp.set_payload(payload);
    }
    // A computed zero is sent as all ones; zero means "no checksum" for UDP.
    let checksum = match transport_checksum(src, dst, IpNextHeaderProtocols::Udp, &buf) {
        0 => 0xFFFF,
        c => c,
    };
    buf[6..8].copy_from_slice(&checksum.to_be_bytes());
    Ok(buf)
}

/// Fragment-specific IPv4 header fields.
#[derive(Debug, Clone, Copy)]
pub struct FragmentHeader {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub identification: u16,
    pub protocol: IpNextHeaderProtocol,
    /// Offset of this fragment's payload, in 8-byte units.
    pub offset_units: u16,
    pub more_fragments: bool,
}

/// One IPv4 packet carrying `payload`, with the header checksum computed.
pub fn build_ipv4_fragment(header: &FragmentHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let total_len = IPV4_HEADER_LEN + payload.len();
    let total_len_u16 = u16::try_from(total_len)
        .map_err(|_| anyhow!("IPv4 packet of {total_len} bytes is too large"))?;
    if header.offset_units > 0x1FFF {
        bail!("fragment offset {} does not fit in 13 bits", header.offset_units);
    }

    let mut buf = vec![0u8; total_len];
    {
        let mut ip = MutableIpv4Packet::new(&mut buf)
            .ok_or_else(|| anyhow!("buffer too small for IPv4 header"))?;
        ip.set_version(4);
        ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip.set_total_length(total_len_u16);
        ip.set_identification(header.identification);
        ip.set_flags(if header.more_fragments {
            Ipv4Flags::MoreFragments
        } else {
            0
        });
        ip.set_fragment_offset(header.offset_units);
        ip.set_ttl(DEFAULT_TTL);
        ip.set_next_level_protocol(header.protocol);
        ip.set_source(header.src);
        ip.set_destination(header.dst);
        ip.set_checksum(0);
        ip.set_payload(payload);
    }
    let checksum = internet_checksum(&buf[..IPV4_HEADER_LEN]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());
    Ok(buf)
}

/// Split a transport segment into exactly two IPv4 fragments.
///
/// The first carries `FRAGMENT_SPLIT` bytes with more-fragments set and offset 0;
/// the second carries the rest, flagged final, at offset `FRAGMENT_SPLIT / 8`.
pub fn fragment_pair(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    identification: u16,
    protocol: IpNextHeaderProtocol,
    segment: &[u8],
) -> Result<[Vec<u8>; 2]> {
    if segment.len() <= FRAGMENT_SPLIT {
        bail!(
            "segment of {} bytes is too short to split after {} bytes",
            segment.len(),
            FRAGMENT_SPLIT
        );
    }
    let (head, tail) = segment.split_at(FRAGMENT_SPLIT);
    let first = FragmentHeader {
        src,
        dst,
        identification,
        protocol,
        offset_units: 0,
        more_fragments: true,
    };
    let second = FragmentHeader {
        offset_units: (FRAGMENT_SPLIT / 8) as u16,
        more_fragments: false,
        ..first
    };
    Ok([
        build_ipv4_fragment(&first, head)?,
        build_ipv4_fragment(&second, tail)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::ipv4::Ipv4Packet;
    use pnet::packet::Packet;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    // Sum including the checksum field; a valid buffer folds to 0xFFFF, so the
    // complemented result is zero.
    fn verify(data: &[u8]) -> u16 {
        internet_checksum(data)
    }

    #[test]
    fn checksum_even_bytes() {
        // 0x0001 + 0x0002 = 0x0003 -> !0x0003
        assert_eq!(internet_checksum(&[0x00, 0x01, 0x00, 0x02]), 0xFFFC);
    }

    #[test]
    fn checksum_with_carry() {
        assert_eq!(internet_checksum(&[0xFF, 0xFF, 0x00, 0x01]), 0xFFFE);
    }

    #[test]
    fn checksum_odd_length_pads_with_zero() {
        assert_eq!(
            internet_checksum(&[0x12, 0x34, 0x56]),
            internet_checksum(&[0x12, 0x34, 0x56, 0x00])
        );
    }

    #[test]
    fn ip_header_checksum_folds_to_zero() {
        let syn = build_tcp_syn(SRC, DST, 50000, 80, 7).unwrap();
        let [a, b] = fragment_pair(SRC, DST, 0x1234, IpNextHeaderProtocols::Tcp, &syn).unwrap();
        assert_eq!(verify(&a[..IPV4_HEADER_LEN]), 0);
        assert_eq!(verify(&b[..IPV4_HEADER_LEN]), 0);
    }

    #[test]
    fn ip_header_checksum_matches_pnet() {
        let header = FragmentHeader {
            src: SRC,
            dst: DST,
            identification: 42,
            protocol: IpNextHeaderProtocols::Udp,
            offset_units: 0,
            more_fragments: false,
        };
        let pkt = build_ipv4_fragment(&header, &[1, 2, 3]).unwrap();
        let parsed = Ipv4Packet::new(&pkt).unwrap();
        assert_eq!(parsed.get_checksum(), pnet::packet::ipv4::checksum(&parsed));
    }

    #[test]
    fn tcp_checksum_verifies_with_pseudo_header() {
        let syn = build_tcp_syn(SRC, DST, 50000, 443, 0xDEADBEEF).unwrap();
        let mut pseudo = Vec::new();
        pseudo.extend_from_slice(&SRC.octets());
        pseudo.extend_from_slice(&DST.octets());
        pseudo.extend_from_slice(&[0, 6, 0, TCP_HEADER_LEN as u8]);
        pseudo.extend_from_slice(&syn);
        assert_eq!(verify(&pseudo), 0);
        assert_eq!(syn[13], TcpFlags::SYN as u8);
    }

    #[test]
    fn udp_checksum_never_zero() {
        let udp = build_udp(SRC, DST, 40000, 53, b"abc").unwrap();
        assert_eq!(udp.len(), UDP_HEADER_LEN + 3);
        assert_ne!(u16::from_be_bytes([udp[6], udp[7]]), 0);
    }

    #[test]
    fn tcp_split_separates_flags_from_first_fragment() {
        let syn = build_tcp_syn(SRC, DST, 50000, 22, 1).unwrap();
        let [a, b] = fragment_pair(SRC, DST, 7, IpNextHeaderProtocols::Tcp, &syn).unwrap();

        let first = Ipv4Packet::new(&a).unwrap();
        assert_eq!(first.get_flags(), Ipv4Flags::MoreFragments);
        assert_eq!(first.get_fragment_offset(), 0);
        assert_eq!(first.payload(), &syn[..8]);
        assert_eq!(first.get_total_length() as usize, IPV4_HEADER_LEN + 8);

        let second = Ipv4Packet::new(&b).unwrap();
        assert_eq!(second.get_flags(), 0);
        assert_eq!(second.get_fragment_offset(), 1);
        assert_eq!(second.payload(), &syn[8..]);
        // TCP flags live at byte 13 of the header: 5 bytes into fragment two.
        assert_eq!(second.payload()[13 - 8], TcpFlags::SYN as u8);
        assert_eq!(first.get_identification(), second.get_identification());
    }

    #[test]
    fn segment_too_short_to_split() {
        assert!(fragment_pair(SRC, DST, 1, IpNextHeaderProtocols::Udp, &[0u8; 8]).is_err());
    }
}
