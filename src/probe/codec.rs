//! Wire encoding and decoding for ICMP Echo and TCP SYN probes.
//!
//! Decoding only trusts lengths it has checked: every decoder fails with
//! `MalformedPacket` when the buffer is shorter than the fixed header, and
//! ICMP error payloads are walked using the embedded IP header's own IHL.

use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use std::net::Ipv4Addr;

use crate::error::TraceError;

/// ICMP header size (type, code, checksum, identifier, sequence)
pub const ICMP_HEADER_SIZE: usize = 8;
/// TCP header size without options
pub const TCP_HEADER_SIZE: usize = 20;
/// Minimum IPv4 header size
pub const IPV4_HEADER_SIZE: usize = 20;

/// IP protocol numbers
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;

/// ICMP type codes
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

/// TCP flags
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_ACK: u8 = 0x10;

/// Decoded ICMP message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpMessage {
    pub icmp_type: u8,
    pub code: u8,
    /// Bytes 4-5; meaningful for Echo messages only
    pub identifier: u16,
    /// Bytes 6-7; meaningful for Echo messages only
    pub sequence: u16,
    /// Original datagram quoted by an error message
    pub embedded: Option<EmbeddedDatagram>,
}

impl IcmpMessage {
    pub fn is_echo_reply(&self) -> bool {
        self.icmp_type == ICMP_ECHO_REPLY
    }

    pub fn is_time_exceeded(&self) -> bool {
        self.icmp_type == ICMP_TIME_EXCEEDED
    }

    pub fn is_dest_unreachable(&self) -> bool {
        self.icmp_type == ICMP_DEST_UNREACHABLE
    }

    /// The quoted TCP header, if this error message carries one
    pub fn embedded_tcp(&self) -> Option<(u16, u16, u32)> {
        match self.embedded?.transport {
            EmbeddedTransport::Tcp {
                src_port,
                dst_port,
                sequence,
            } => Some((src_port, dst_port, sequence)),
            _ => None,
        }
    }
}

/// Original datagram quoted inside an ICMP error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedDatagram {
    /// Destination of the original datagram
    pub destination: Ipv4Addr,
    pub transport: EmbeddedTransport,
}

/// First 8 bytes of the original transport header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddedTransport {
    Icmp {
        icmp_type: u8,
        code: u8,
        identifier: u16,
        sequence: u16,
    },
    Tcp {
        src_port: u16,
        dst_port: u16,
        sequence: u32,
    },
    Other {
        protocol: u8,
    },
}

/// Decoded TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    pub flags: u8,
    pub window: u16,
}

impl TcpSegment {
    pub fn is_syn_ack(&self) -> bool {
        self.flags & (TCP_FLAG_SYN | TCP_FLAG_ACK) == (TCP_FLAG_SYN | TCP_FLAG_ACK)
    }

    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }
}

/// Build an ICMP Echo Request with the given payload
pub fn encode_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload.len()];

    buffer[0] = ICMP_ECHO_REQUEST;
    buffer[1] = 0;
    buffer[4..6].copy_from_slice(&identifier.to_be_bytes());
    buffer[6..8].copy_from_slice(&sequence.to_be_bytes());
    buffer[ICMP_HEADER_SIZE..].copy_from_slice(payload);

    // Word 1 is the checksum field itself
    let cksum = pnet::util::checksum(&buffer, 1);
    buffer[2..4].copy_from_slice(&cksum.to_be_bytes());

    buffer
}

/// Decode an ICMP message (starting at the ICMP header, no IP header)
pub fn decode_icmp(data: &[u8]) -> Result<IcmpMessage, TraceError> {
    if data.len() < ICMP_HEADER_SIZE {
        return Err(TraceError::malformed(ICMP_HEADER_SIZE, data.len()));
    }
    let packet =
        IcmpPacket::new(data).ok_or_else(|| TraceError::malformed(ICMP_HEADER_SIZE, data.len()))?;

    let icmp_type = packet.get_icmp_type();
    let embedded = if icmp_type == IcmpTypes::TimeExceeded
        || icmp_type == IcmpTypes::DestinationUnreachable
    {
        decode_embedded(&data[ICMP_HEADER_SIZE..])
    } else {
        None
    };

    Ok(IcmpMessage {
        icmp_type: icmp_type.0,
        code: packet.get_icmp_code().0,
        identifier: u16::from_be_bytes([data[4], data[5]]),
        sequence: u16::from_be_bytes([data[6], data[7]]),
        embedded,
    })
}

/// Locate the original transport header inside an ICMP error payload.
///
/// The embedded IP header length comes from its own IHL field (low nibble of
/// byte 0, in 32-bit words), so quoted IP options are skipped correctly.
fn decode_embedded(original_ip_data: &[u8]) -> Option<EmbeddedDatagram> {
    let original_ip = Ipv4Packet::new(original_ip_data)?;
    let orig_ihl = (original_ip.get_header_length() as usize) * 4;

    // RFC 792 guarantees the IP header plus 8 bytes of original payload
    if orig_ihl < IPV4_HEADER_SIZE || original_ip_data.len() < orig_ihl + 8 {
        return None;
    }

    let original_payload = &original_ip_data[orig_ihl..];
    let transport = match original_ip.get_next_level_protocol().0 {
        IPPROTO_ICMP => EmbeddedTransport::Icmp {
            icmp_type: original_payload[0],
            code: original_payload[1],
            identifier: u16::from_be_bytes([original_payload[4], original_payload[5]]),
            sequence: u16::from_be_bytes([original_payload[6], original_payload[7]]),
        },
        IPPROTO_TCP => EmbeddedTransport::Tcp {
            src_port: u16::from_be_bytes([original_payload[0], original_payload[1]]),
            dst_port: u16::from_be_bytes([original_payload[2], original_payload[3]]),
            sequence: u32::from_be_bytes([
                original_payload[4],
                original_payload[5],
                original_payload[6],
                original_payload[7],
            ]),
        },
        protocol => EmbeddedTransport::Other { protocol },
    };

    Some(EmbeddedDatagram {
        destination: original_ip.get_destination(),
        transport,
    })
}

/// Build a TCP SYN segment (no IP header - kernel adds that)
pub fn encode_tcp_syn(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    sequence: u32,
) -> Vec<u8> {
    let mut packet = vec![0u8; TCP_HEADER_SIZE];

    packet[0..2].copy_from_slice(&src_port.to_be_bytes());
    packet[2..4].copy_from_slice(&dst_port.to_be_bytes());
    packet[4..8].copy_from_slice(&sequence.to_be_bytes());
    // Acknowledgment number stays 0 for SYN

    // Data offset = 5 (20 bytes / 4)
    packet[12] = 0x50;
    packet[13] = TCP_FLAG_SYN;
    packet[14..16].copy_from_slice(&65535u16.to_be_bytes());
    // Urgent pointer stays 0

    let checksum = tcp_checksum(&packet, src_ip, dst_ip);
    packet[16..18].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Decode a TCP header
pub fn decode_tcp(data: &[u8]) -> Result<TcpSegment, TraceError> {
    if data.len() < TCP_HEADER_SIZE {
        return Err(TraceError::malformed(TCP_HEADER_SIZE, data.len()));
    }

    Ok(TcpSegment {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        acknowledgement: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        flags: data[13],
        window: u16::from_be_bytes([data[14], data[15]]),
    })
}

/// TCP checksum over the IPv4 pseudo-header and the segment
fn tcp_checksum(segment: &[u8], src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> u16 {
    let mut sum: u32 = 0;

    // Pseudo-header: src_ip (4) + dst_ip (4) + zero (1) + protocol (1) + tcp_len (2)
    for octet in src_ip.octets().chunks(2) {
        sum += u16::from_be_bytes([octet[0], octet[1]]) as u32;
    }
    for octet in dst_ip.octets().chunks(2) {
        sum += u16::from_be_bytes([octet[0], octet[1]]) as u32;
    }
    sum += IPPROTO_TCP as u32;
    sum += segment.len() as u32;

    let mut i = 0;
    while i + 1 < segment.len() {
        // Skip checksum field at offset 16-17
        if i != 16 {
            sum += u16::from_be_bytes([segment[i], segment[i + 1]]) as u32;
        }
        i += 2;
    }

    if i < segment.len() {
        sum += (segment[i] as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}
