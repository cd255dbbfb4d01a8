use pnet::packet::ipv4::Ipv4Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use crate::error::TraceError;

/// Largest datagram we expect to read back
const RECV_BUFFER_SIZE: usize = 1500;

/// An ICMP message read from the probe socket, IP header stripped
#[derive(Debug, Clone)]
pub struct IcmpReply {
    pub source: Ipv4Addr,
    pub data: Vec<u8>,
    pub received_at: Instant,
}

/// Send/receive path used by the ICMP prober
pub trait IcmpChannel: Send {
    fn set_ttl(&mut self, ttl: u8) -> io::Result<()>;

    fn send_to(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize>;

    /// Wait up to `timeout` for one ICMP message; `Ok(None)` when nothing arrived
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<IcmpReply>>;
}

/// Transmit path used by the TCP prober; replies are read by the capture
pub trait SynTransport: Send {
    fn set_ttl(&mut self, ttl: u8) -> io::Result<()>;

    fn send_to(&mut self, segment: &[u8], target: SocketAddrV4) -> io::Result<usize>;
}

/// Raw ICMPv4 socket (requires root or CAP_NET_RAW)
pub struct RawIcmpChannel {
    socket: Socket,
    buffer: Vec<u8>,
}

impl RawIcmpChannel {
    pub fn open(interface: Option<&str>) -> Result<Self, TraceError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(TraceError::Socket)?;
        socket.set_nonblocking(false).map_err(TraceError::Socket)?;
        if let Err(e) = socket.set_recv_buffer_size(1024 * 1024) {
            tracing::debug!("could not enlarge receive buffer: {}", e);
        }
        if let Some(name) = interface {
            bind_to_interface(&socket, name)?;
        }

        Ok(Self {
            socket,
            buffer: vec![0u8; RECV_BUFFER_SIZE],
        })
    }
}

impl IcmpChannel for RawIcmpChannel {
    fn set_ttl(&mut self, ttl: u8) -> io::Result<()> {
        self.socket.set_ttl(ttl as u32)
    }

    fn send_to(&mut self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddr::new(target.into(), 0));
        self.socket.send_to(packet, &addr)
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<IcmpReply>> {
        if timeout.is_zero() {
            return Ok(None);
        }
        self.socket.set_read_timeout(Some(timeout))?;

        let len = match (&self.socket).read(&mut self.buffer) {
            Ok(len) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let received_at = Instant::now();

        // Raw IPv4 sockets deliver the IP header along with the ICMP message
        let datagram = &self.buffer[..len];
        let Some(ip) = Ipv4Packet::new(datagram) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("short IPv4 datagram ({} bytes)", len),
            ));
        };
        let header_len = (ip.get_header_length() as usize) * 4;
        if header_len > len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("IPv4 header length {} exceeds datagram ({} bytes)", header_len, len),
            ));
        }

        Ok(Some(IcmpReply {
            source: ip.get_source(),
            data: datagram[header_len..].to_vec(),
            received_at,
        }))
    }
}

/// Raw TCP socket for sending SYN probes; the kernel adds the IP header
pub struct RawSynTransport {
    socket: Socket,
}

impl RawSynTransport {
    pub fn open(interface: Option<&str>) -> Result<Self, TraceError> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::TCP))
            .map_err(TraceError::Socket)?;
        socket.set_nonblocking(false).map_err(TraceError::Socket)?;
        if let Some(name) = interface {
            bind_to_interface(&socket, name)?;
        }
        Ok(Self { socket })
    }
}

impl SynTransport for RawSynTransport {
    fn set_ttl(&mut self, ttl: u8) -> io::Result<()> {
        self.socket.set_ttl(ttl as u32)
    }

    fn send_to(&mut self, segment: &[u8], target: SocketAddrV4) -> io::Result<usize> {
        let addr = SockAddr::from(SocketAddr::V4(target));
        self.socket.send_to(segment, &addr)
    }
}

/// Bind a socket to a network interface (SO_BINDTODEVICE)
#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
pub fn bind_to_interface(socket: &Socket, name: &str) -> Result<(), TraceError> {
    socket.bind_device(Some(name.as_bytes())).map_err(|e| {
        TraceError::Interface(format!(
            "failed to bind socket to interface '{}': {}",
            name, e
        ))
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
pub fn bind_to_interface(socket: &Socket, name: &str) -> Result<(), TraceError> {
    let _ = socket;
    Err(TraceError::Interface(format!(
        "binding to interface '{}' is only supported on Linux",
        name
    )))
}

/// Local address the kernel would use to reach `target`.
///
/// Uses the UDP connect trick: nothing is sent, the socket only picks a route.
/// The TCP checksum depends on this address, so failure is an error.
pub fn get_local_addr(target: Ipv4Addr) -> Result<Ipv4Addr, TraceError> {
    let socket = UdpSocket::bind("0.0.0.0:0").map_err(TraceError::Socket)?;
    socket
        .connect(SocketAddrV4::new(target, 80))
        .map_err(TraceError::Socket)?;

    match socket.local_addr().map_err(TraceError::Socket)? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
        other => Err(TraceError::Socket(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable local IPv4 address toward {} (got {})", target, other),
        ))),
    }
}
