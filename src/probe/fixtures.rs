//! Packet builders for unit tests.

use std::net::Ipv4Addr;

use super::codec::{
    ICMP_DEST_UNREACHABLE, ICMP_ECHO_REPLY, ICMP_HEADER_SIZE, ICMP_TIME_EXCEEDED, IPPROTO_ICMP,
    IPV4_HEADER_SIZE,
};

/// IPv4 header with the given options (length must be a multiple of 4)
pub fn ipv4_header(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    options: &[u8],
    payload_len: usize,
) -> Vec<u8> {
    let header_len = IPV4_HEADER_SIZE + options.len();
    let mut header = vec![0u8; header_len];
    header[0] = 0x40 | (header_len / 4) as u8;
    header[2..4].copy_from_slice(&((header_len + payload_len) as u16).to_be_bytes());
    header[8] = 1;
    header[9] = protocol;
    header[12..16].copy_from_slice(&source.octets());
    header[16..20].copy_from_slice(&destination.octets());
    header[IPV4_HEADER_SIZE..].copy_from_slice(options);
    header
}

/// Full IPv4 datagram around `payload`
pub fn ipv4_datagram(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    payload: &[u8],
) -> Vec<u8> {
    let mut datagram = ipv4_header(source, destination, protocol, &[], payload.len());
    datagram.extend_from_slice(payload);
    datagram
}

fn icmp_error(icmp_type: u8, code: u8, quoted: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_SIZE];
    packet[0] = icmp_type;
    packet[1] = code;
    packet.extend_from_slice(quoted);
    let cksum = pnet::util::checksum(&packet, 1);
    packet[2..4].copy_from_slice(&cksum.to_be_bytes());
    packet
}

/// Time Exceeded quoting `original` sent from `source` to `destination`
pub fn time_exceeded(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    original: &[u8],
) -> Vec<u8> {
    time_exceeded_with_options(source, destination, protocol, &[], original)
}

/// Time Exceeded whose quoted IP header carries options
pub fn time_exceeded_with_options(
    source: Ipv4Addr,
    destination: Ipv4Addr,
    protocol: u8,
    options: &[u8],
    original: &[u8],
) -> Vec<u8> {
    let mut quoted = ipv4_header(source, destination, protocol, options, original.len());
    quoted.extend_from_slice(original);
    icmp_error(ICMP_TIME_EXCEEDED, 0, &quoted)
}

/// Port Unreachable quoting `original` sent to `destination`
pub fn dest_unreachable(destination: Ipv4Addr, protocol: u8, original: &[u8]) -> Vec<u8> {
    let mut quoted = ipv4_header(
        Ipv4Addr::new(192, 0, 2, 1),
        destination,
        protocol,
        &[],
        original.len(),
    );
    quoted.extend_from_slice(original);
    icmp_error(ICMP_DEST_UNREACHABLE, 3, &quoted)
}

/// Echo Reply with the given identifier and sequence
pub fn echo_reply(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_SIZE];
    packet[0] = ICMP_ECHO_REPLY;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet.extend_from_slice(b"PING..");
    let cksum = pnet::util::checksum(&packet, 1);
    packet[2..4].copy_from_slice(&cksum.to_be_bytes());
    packet
}

/// Bare 20-byte TCP header
pub fn tcp_segment(src_port: u16, dst_port: u16, sequence: u32, ack: u32, flags: u8) -> Vec<u8> {
    let mut segment = vec![0u8; 20];
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    segment[4..8].copy_from_slice(&sequence.to_be_bytes());
    segment[8..12].copy_from_slice(&ack.to_be_bytes());
    segment[12] = 0x50;
    segment[13] = flags;
    segment[14..16].copy_from_slice(&29200u16.to_be_bytes());
    segment
}

#[test]
fn test_echo_reply_is_icmp() {
    let packet = echo_reply(1, 2);
    assert_eq!(packet[0], ICMP_ECHO_REPLY);
    let datagram = ipv4_datagram(
        Ipv4Addr::new(1, 1, 1, 1),
        Ipv4Addr::new(10, 0, 0, 1),
        IPPROTO_ICMP,
        &packet,
    );
    assert_eq!(datagram[0], 0x45);
    assert_eq!(datagram.len(), IPV4_HEADER_SIZE + packet.len());
}
