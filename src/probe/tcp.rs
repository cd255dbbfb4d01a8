//! TCP SYN probes.
//!
//! The prober only transmits. Replies (ICMP errors from routers, the target's
//! SYN+ACK) are read by the response capture and handed back through the
//! coordinator.

use std::net::{Ipv4Addr, SocketAddrV4};
use tracing::{Instrument, Span};

use super::codec::encode_tcp_syn;
use super::socket::SynTransport;
use crate::error::TraceError;
use crate::state::{HopResult, Probe};
use crate::trace::coordinator::{HandoffError, ProberSide};

/// Source port for a TTL: one port per hop so replies can be told apart
pub fn source_port(base: u16, ttl: u8) -> u16 {
    base.wrapping_add(ttl as u16)
}

pub struct TcpProber {
    transport: Box<dyn SynTransport>,
    coordinator: ProberSide,
    source: Ipv4Addr,
    target: SocketAddrV4,
    src_port_base: u16,
    span: Span,
}

impl TcpProber {
    pub fn new(
        transport: Box<dyn SynTransport>,
        coordinator: ProberSide,
        source: Ipv4Addr,
        target: SocketAddrV4,
        src_port_base: u16,
        span: Span,
    ) -> Self {
        Self {
            transport,
            coordinator,
            source,
            target,
            src_port_base,
            span,
        }
    }

    /// Send a SYN with the given TTL and wait for the capture's verdict.
    ///
    /// A probe the capture never picks up is a Timeout hop. A verdict that
    /// never arrives, or a capture that is gone, ends the session.
    pub async fn probe(&mut self, ttl: u8) -> Result<HopResult, TraceError> {
        let span = self.span.clone();
        self.probe_inner(ttl).instrument(span).await
    }

    async fn probe_inner(&mut self, ttl: u8) -> Result<HopResult, TraceError> {
        let src_port = source_port(self.src_port_base, ttl);
        let isn = rand::random::<u32>();
        let segment = encode_tcp_syn(
            self.source,
            *self.target.ip(),
            src_port,
            self.target.port(),
            isn,
        );

        if let Err(e) = self.transport.set_ttl(ttl) {
            tracing::warn!(ttl, "failed to set TTL: {}", e);
            return Ok(HopResult::timeout(ttl));
        }

        let probe = Probe::syn(ttl, src_port, isn);
        if let Err(source) = self.transport.send_to(&segment, self.target) {
            tracing::warn!("{}", TraceError::Transmit { ttl, source });
            return Ok(HopResult::timeout(ttl));
        }
        tracing::debug!(ttl, src_port, isn, "SYN sent");

        match self.coordinator.probe_sent(probe).await {
            Ok(()) => {}
            Err(HandoffError::TimedOut(waited)) => {
                tracing::warn!(ttl, "capture did not pick up the probe within {:?}", waited);
                return Ok(HopResult::timeout(ttl));
            }
            Err(HandoffError::Closed) => return Err(TraceError::CaptureClosed),
        }

        match self.coordinator.await_ready().await {
            Ok(mut hop) => {
                hop.ttl = ttl;
                Ok(hop)
            }
            Err(HandoffError::TimedOut(waited)) => Err(TraceError::Timeout(waited)),
            Err(HandoffError::Closed) => Err(TraceError::CaptureClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::codec::{TCP_FLAG_SYN, decode_tcp};
    use crate::state::Classification;
    use crate::trace::coordinator::coordinator;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const TARGET: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 443);

    #[derive(Default, Clone)]
    struct FakeTransport {
        sent: Arc<Mutex<Vec<(u8, Vec<u8>)>>>,
        ttl: u8,
    }

    impl SynTransport for FakeTransport {
        fn set_ttl(&mut self, ttl: u8) -> io::Result<()> {
            self.ttl = ttl;
            Ok(())
        }

        fn send_to(&mut self, segment: &[u8], target: SocketAddrV4) -> io::Result<usize> {
            assert_eq!(target, TARGET);
            self.sent.lock().unwrap().push((self.ttl, segment.to_vec()));
            Ok(segment.len())
        }
    }

    #[test]
    fn test_source_port_per_ttl() {
        assert_eq!(source_port(0xaa47, 1), 43592);
        assert_eq!(source_port(0xaa47, 64), 43655);
        assert_eq!(source_port(u16::MAX, 1), 0);
    }

    #[tokio::test]
    async fn test_probe_sends_syn_and_returns_capture_verdict() {
        let (prober_side, mut capture_side) = coordinator(Duration::from_secs(2));
        let transport = FakeTransport::default();
        let sent = transport.sent.clone();
        let mut prober = TcpProber::new(
            Box::new(transport),
            prober_side,
            Ipv4Addr::new(192, 168, 1, 10),
            TARGET,
            0xaa47,
            Span::none(),
        );

        let capture = tokio::spawn(async move {
            let probe = capture_side.await_probe().await.unwrap();
            let hop = HopResult::matched(
                probe.ttl,
                Ipv4Addr::new(10, 0, 0, 1),
                Classification::TimeExceeded,
                Duration::from_millis(2),
            );
            capture_side.ready(hop).await.unwrap();
            probe
        });

        let hop = prober.probe(3).await.unwrap();
        assert_eq!(hop.ttl, 3);
        assert_eq!(hop.classification, Classification::TimeExceeded);

        let probe = capture.await.unwrap();
        let sent = sent.lock().unwrap();
        let (ttl, segment) = &sent[0];
        assert_eq!(*ttl, 3);
        let syn = decode_tcp(segment).unwrap();
        assert_eq!(syn.flags, TCP_FLAG_SYN);
        assert_eq!(syn.src_port, 43594);
        assert_eq!(syn.dst_port, 443);
        assert_eq!(Some(syn.sequence), probe.initial_seq);
    }

    #[tokio::test]
    async fn test_unclaimed_probe_is_timeout() {
        let (prober_side, _capture_side) = coordinator(Duration::from_millis(50));
        let mut prober = TcpProber::new(
            Box::new(FakeTransport::default()),
            prober_side,
            Ipv4Addr::new(192, 168, 1, 10),
            TARGET,
            0xaa47,
            Span::none(),
        );

        let hop = prober.probe(1).await.unwrap();
        assert_eq!(hop.classification, Classification::Timeout);
    }

    #[tokio::test]
    async fn test_missing_verdict_is_fatal() {
        let (prober_side, mut capture_side) = coordinator(Duration::from_millis(100));
        let mut prober = TcpProber::new(
            Box::new(FakeTransport::default()),
            prober_side,
            Ipv4Addr::new(192, 168, 1, 10),
            TARGET,
            0xaa47,
            Span::none(),
        );

        // Claims the probe but never reports back
        let capture = tokio::spawn(async move {
            let _ = capture_side.await_probe().await;
            tokio::time::sleep(Duration::from_millis(300)).await;
            capture_side
        });

        let err = prober.probe(1).await.unwrap_err();
        assert!(matches!(err, TraceError::Timeout(_)));
        drop(capture.await.unwrap());
    }

    #[tokio::test]
    async fn test_lost_capture_is_fatal() {
        let (prober_side, capture_side) = coordinator(Duration::from_secs(2));
        drop(capture_side);
        let mut prober = TcpProber::new(
            Box::new(FakeTransport::default()),
            prober_side,
            Ipv4Addr::new(192, 168, 1, 10),
            TARGET,
            0xaa47,
            Span::none(),
        );

        let err = prober.probe(1).await.unwrap_err();
        assert!(matches!(err, TraceError::CaptureClosed));
    }
}
