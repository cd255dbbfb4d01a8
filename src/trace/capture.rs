//! Out-of-band response capture for TCP mode.
//!
//! Reader threads pull frames off every capture interface, keep the ones the
//! [`CaptureFilter`] accepts and queue them. [`ResponseCapture`] consumes that
//! queue one probe at a time, in lockstep with the prober via the coordinator.

use anyhow::Result;
use pnet::datalink::{self, Channel, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ipv4::Ipv4Packet;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::error::TraceError;
use crate::probe::codec::{IPPROTO_ICMP, IPPROTO_TCP, IPV4_HEADER_SIZE, decode_icmp, decode_tcp};
use crate::probe::interface::frames_are_bare_ip;
use crate::state::{Classification, HopResult, Probe};
use crate::trace::coordinator::{CaptureSide, HandoffError};

/// Queue depth between reader threads and the capture task
pub const CAPTURE_QUEUE_DEPTH: usize = 1024;

/// How often reader threads wake up to check for shutdown
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum consecutive errors before a reader gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// An IPv4 datagram seen on a capture interface
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub protocol: u8,
    /// Transport header onward
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

/// `icmp or (tcp and host <target>)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFilter {
    pub host: Ipv4Addr,
}

impl CaptureFilter {
    pub fn new(host: Ipv4Addr) -> Self {
        Self { host }
    }

    pub fn matches(&self, protocol: u8, source: Ipv4Addr, destination: Ipv4Addr) -> bool {
        match protocol {
            IPPROTO_ICMP => true,
            IPPROTO_TCP => source == self.host || destination == self.host,
            _ => false,
        }
    }
}

impl fmt::Display for CaptureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "icmp or (tcp and host {})", self.host)
    }
}

/// Extract the IPv4 datagram from a captured frame
pub fn parse_frame(frame: &[u8], bare_ip: bool) -> Option<(Ipv4Addr, Ipv4Addr, u8, &[u8])> {
    let datagram = if bare_ip {
        frame
    } else {
        let ethernet = EthernetPacket::new(frame)?;
        if ethernet.get_ethertype() != EtherTypes::Ipv4 {
            return None;
        }
        &frame[EthernetPacket::minimum_packet_size()..]
    };

    let ip = Ipv4Packet::new(datagram)?;
    if ip.get_version() != 4 {
        return None;
    }
    let header_len = (ip.get_header_length() as usize) * 4;
    // Ethernet frames may carry trailing padding past the IP total length
    let total_len = (ip.get_total_length() as usize).min(datagram.len());
    if header_len < IPV4_HEADER_SIZE || header_len > total_len {
        return None;
    }

    Some((
        ip.get_source(),
        ip.get_destination(),
        ip.get_next_level_protocol().0,
        &datagram[header_len..total_len],
    ))
}

/// Open a channel on every interface and start one reader thread per interface.
///
/// All channels are opened before any thread starts, so a permission problem
/// is reported here rather than from a background thread.
pub fn spawn_readers(
    interfaces: Vec<NetworkInterface>,
    filter: CaptureFilter,
    packets: mpsc::Sender<CapturedPacket>,
    stop: CancellationToken,
) -> Result<Vec<std::thread::JoinHandle<Result<()>>>, TraceError> {
    let config = datalink::Config {
        read_timeout: Some(READ_POLL_INTERVAL),
        ..Default::default()
    };

    let mut opened = Vec::with_capacity(interfaces.len());
    for iface in interfaces {
        let rx = match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => rx,
            Ok(_) => {
                return Err(TraceError::Interface(format!(
                    "unsupported capture channel on '{}'",
                    iface.name
                )));
            }
            Err(e) => return Err(TraceError::Socket(e)),
        };
        tracing::debug!(interface = %iface.name, %filter, "capture opened");
        opened.push((iface, rx));
    }

    let mut handles = Vec::with_capacity(opened.len());
    for (iface, rx) in opened {
        let packets = packets.clone();
        let stop = stop.clone();
        let name = iface.name.clone();
        let bare_ip = frames_are_bare_ip(&iface);

        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || {
                // Catch panics and convert to error with details
                let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    read_frames(rx, bare_ip, filter, packets, stop)
                })) {
                    Ok(result) => result,
                    Err(panic_payload) => {
                        let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                            s.to_string()
                        } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                            s.clone()
                        } else {
                            "unknown panic".to_string()
                        };
                        Err(anyhow::anyhow!("Capture reader on {} panicked: {}", name, msg))
                    }
                };
                if let Err(e) = &result {
                    tracing::error!("{:#}", e);
                }
                result
            })
            .map_err(TraceError::Socket)?;
        handles.push(handle);
    }

    Ok(handles)
}

fn read_frames(
    mut rx: Box<dyn datalink::DataLinkReceiver>,
    bare_ip: bool,
    filter: CaptureFilter,
    packets: mpsc::Sender<CapturedPacket>,
    stop: CancellationToken,
) -> Result<()> {
    let mut consecutive_errors = 0u32;

    while !stop.is_cancelled() {
        match rx.next() {
            Ok(frame) => {
                consecutive_errors = 0;
                let Some((source, destination, protocol, payload)) = parse_frame(frame, bare_ip)
                else {
                    continue;
                };
                if !filter.matches(protocol, source, destination) {
                    continue;
                }

                let packet = CapturedPacket {
                    source,
                    destination,
                    protocol,
                    payload: payload.to_vec(),
                    received_at: Instant::now(),
                };
                match packets.try_send(packet) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!("capture queue full, dropping packet");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                consecutive_errors = 0;
            }
            Err(e) => {
                consecutive_errors += 1;
                tracing::warn!(
                    "capture read error ({}/{}): {}",
                    consecutive_errors,
                    MAX_CONSECUTIVE_ERRORS,
                    e
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    return Err(anyhow::anyhow!(
                        "capture stopped: {} consecutive errors (last: {})",
                        consecutive_errors,
                        e
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Why the capture task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureExit {
    /// The target answered with SYN+ACK
    Reached,
    /// The prober finished or the session was cancelled
    Closed,
    /// A handoff timed out or the readers died
    Aborted,
}

/// What a finished capture left behind
#[derive(Debug)]
pub struct CaptureSummary {
    pub exit: CaptureExit,
    /// Readers that stopped with an error (already logged as they happened)
    pub reader_errors: Vec<anyhow::Error>,
}

/// A running capture: the classifying task plus the reader threads feeding it
pub struct CaptureTask {
    task: JoinHandle<CaptureExit>,
    readers: Vec<std::thread::JoinHandle<Result<()>>>,
    stop: CancellationToken,
}

impl CaptureTask {
    /// `stop` must be the token the readers poll
    pub fn new(
        task: JoinHandle<CaptureExit>,
        readers: Vec<std::thread::JoinHandle<Result<()>>>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            task,
            readers,
            stop,
        }
    }

    /// Wait for the capture task, then stop and join every reader.
    ///
    /// The task ends once the prober side is dropped, so call this after the
    /// session has finished.
    pub async fn finish(self) -> Result<CaptureSummary> {
        let exit = self.task.await?;
        self.stop.cancel();

        let readers = self.readers;
        let reader_errors = tokio::task::spawn_blocking(move || {
            readers
                .into_iter()
                .filter_map(|reader| match reader.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(anyhow::anyhow!("capture reader panicked")),
                })
                .collect::<Vec<_>>()
        })
        .await?;

        if !reader_errors.is_empty() {
            tracing::warn!(failed = reader_errors.len(), "capture readers stopped with errors");
        }
        Ok(CaptureSummary {
            exit,
            reader_errors,
        })
    }
}

/// Classifies captured packets for one probe at a time
pub struct ResponseCapture {
    packets: mpsc::Receiver<CapturedPacket>,
    coordinator: CaptureSide,
    target: Ipv4Addr,
    read_deadline: Duration,
    done: CancellationToken,
    span: Span,
}

impl ResponseCapture {
    /// `done` is cancelled when the target is reached and stops the capture
    /// when cancelled from outside.
    pub fn new(
        packets: mpsc::Receiver<CapturedPacket>,
        coordinator: CaptureSide,
        target: Ipv4Addr,
        read_deadline: Duration,
        done: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            packets,
            coordinator,
            target,
            read_deadline,
            done,
            span,
        }
    }

    /// Token that stops the capture (and its reader threads)
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    pub async fn run(mut self) -> CaptureExit {
        let span = self.span.clone();
        let exit = self.run_inner().instrument(span.clone()).await;
        span.in_scope(|| tracing::debug!(?exit, "capture finished"));
        exit
    }

    async fn run_inner(&mut self) -> CaptureExit {
        loop {
            let probe = tokio::select! {
                _ = self.done.cancelled() => return CaptureExit::Closed,
                accepted = self.coordinator.await_probe() => match accepted {
                    Ok(probe) => probe,
                    Err(HandoffError::Closed) => return CaptureExit::Closed,
                    Err(HandoffError::TimedOut(waited)) => {
                        tracing::warn!("no probe announced within {:?}", waited);
                        return CaptureExit::Aborted;
                    }
                },
            };

            let Some(hop) = self.observe(&probe).await else {
                return CaptureExit::Aborted;
            };
            let reached = hop.classification == Classification::TcpAck;

            match self.coordinator.ready(hop).await {
                Ok(()) => {}
                Err(HandoffError::Closed) => return CaptureExit::Closed,
                Err(HandoffError::TimedOut(waited)) => {
                    tracing::warn!(ttl = probe.ttl, "prober did not take the result within {:?}", waited);
                    return CaptureExit::Aborted;
                }
            }

            if reached {
                self.done.cancel();
                return CaptureExit::Reached;
            }
        }
    }

    /// Read until a packet classifies or the read deadline passes.
    ///
    /// `None` when the reader threads are gone.
    async fn observe(&mut self, probe: &Probe) -> Option<HopResult> {
        let deadline = tokio::time::Instant::now() + self.read_deadline;

        loop {
            let packet = tokio::select! {
                _ = self.done.cancelled() => return Some(HopResult::timeout(probe.ttl)),
                next = tokio::time::timeout_at(deadline, self.packets.recv()) => match next {
                    Err(_) => {
                        tracing::debug!(ttl = probe.ttl, "nothing captured before deadline");
                        return Some(HopResult::timeout(probe.ttl));
                    }
                    Ok(None) => {
                        tracing::warn!("capture readers stopped");
                        return None;
                    }
                    Ok(Some(packet)) => packet,
                },
            };

            // Left over from an earlier probe
            if packet.received_at < probe.sent_at {
                continue;
            }

            if let Some(hop) = self.classify(probe, &packet) {
                tracing::debug!(
                    ttl = probe.ttl,
                    from = %packet.source,
                    classification = %hop.classification,
                    "captured"
                );
                return Some(hop);
            }
        }
    }

    /// Classify one packet; `None` means keep reading
    pub fn classify(&self, probe: &Probe, packet: &CapturedPacket) -> Option<HopResult> {
        let ttl = probe.ttl;
        let rtt = probe.rtt_at(packet.received_at);

        match packet.protocol {
            IPPROTO_TCP => {
                if packet.source != self.target {
                    return None;
                }
                let segment = match decode_tcp(&packet.payload) {
                    Ok(segment) => segment,
                    Err(e) => {
                        tracing::debug!("skipping TCP segment: {}", e);
                        return None;
                    }
                };
                if !segment.is_syn_ack() {
                    return None;
                }
                if let Some(isn) = probe.initial_seq
                    && segment.acknowledgement != isn.wrapping_add(1)
                {
                    tracing::warn!(
                        ttl,
                        ack = segment.acknowledgement,
                        isn,
                        "SYN+ACK does not acknowledge our initial sequence number"
                    );
                }
                Some(HopResult::matched(ttl, packet.source, Classification::TcpAck, rtt))
            }
            IPPROTO_ICMP => {
                let message = match decode_icmp(&packet.payload) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::debug!(from = %packet.source, "undecodable ICMP: {}", e);
                        return Some(HopResult::unknown(ttl));
                    }
                };
                message.embedded_tcp()?;

                let classification = if message.is_time_exceeded() {
                    Classification::TimeExceeded
                } else if message.is_dest_unreachable() {
                    Classification::DestinationUnreachable
                } else {
                    return None;
                };
                Some(HopResult::matched(ttl, packet.source, classification, rtt))
            }
            _ => None,
        }
    }
}
