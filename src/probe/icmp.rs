use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::Span;

use super::codec::{
    ICMP_ECHO_REQUEST, EmbeddedTransport, IcmpMessage, decode_icmp, encode_echo_request,
};
use super::socket::{IcmpChannel, IcmpReply};
use crate::error::TraceError;
use crate::state::{Classification, CorrelationTag, HopResult, Probe};

/// Get process identifier for ICMP identification field
pub fn get_identifier() -> u16 {
    std::process::id() as u16
}

/// Sends one Echo Request per TTL and blocks for the reply
pub struct IcmpProber {
    channel: Box<dyn IcmpChannel>,
    target: Ipv4Addr,
    identifier: u16,
    payload: Vec<u8>,
    timeout: Duration,
    span: Span,
}

impl IcmpProber {
    pub fn new(
        channel: Box<dyn IcmpChannel>,
        target: Ipv4Addr,
        identifier: u16,
        payload: Vec<u8>,
        timeout: Duration,
        span: Span,
    ) -> Self {
        Self {
            channel,
            target,
            identifier,
            payload,
            timeout,
            span,
        }
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    /// Probe one TTL. Blocks for up to the per-hop timeout.
    ///
    /// Send and receive failures resolve the hop as Timeout; the sweep goes on.
    pub fn probe(&mut self, ttl: u8) -> HopResult {
        let _entered = self.span.enter();

        let sequence = ttl as u16;
        let packet = encode_echo_request(self.identifier, sequence, &self.payload);

        if let Err(e) = self.channel.set_ttl(ttl) {
            tracing::warn!(ttl, "failed to set TTL: {}", e);
            return HopResult::timeout(ttl);
        }

        let probe = Probe::echo(ttl, self.identifier, sequence);
        if let Err(source) = self.channel.send_to(&packet, self.target) {
            tracing::warn!("{}", TraceError::Transmit { ttl, source });
            return HopResult::timeout(ttl);
        }

        match self.channel.recv(self.timeout) {
            Ok(Some(reply)) => {
                let hop = classify_reply(&probe, &reply);
                tracing::debug!(
                    ttl,
                    from = %reply.source,
                    classification = %hop.classification,
                    matched = hop.matched,
                    "reply"
                );
                hop
            }
            Ok(None) => {
                tracing::debug!(ttl, "no reply within {:?}", self.timeout);
                HopResult::timeout(ttl)
            }
            Err(e) => {
                tracing::warn!(ttl, "receive failed: {}", e);
                HopResult::timeout(ttl)
            }
        }
    }
}

/// Interpret one ICMP message against the probe that is in flight
pub fn classify_reply(probe: &Probe, reply: &IcmpReply) -> HopResult {
    let ttl = probe.ttl;
    let CorrelationTag::Echo {
        identifier,
        sequence,
    } = probe.tag
    else {
        return HopResult::unknown(ttl);
    };

    let message = match decode_icmp(&reply.data) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(ttl, from = %reply.source, "undecodable reply: {}", e);
            return HopResult::unknown(ttl);
        }
    };
    let rtt = probe.rtt_at(reply.received_at);

    if message.is_echo_reply() {
        if message.identifier == identifier && message.sequence == sequence {
            return HopResult::matched(ttl, reply.source, Classification::EchoReply, rtt);
        }
        return HopResult::unknown(ttl);
    }

    let classification = if message.is_time_exceeded() {
        Classification::TimeExceeded
    } else if message.is_dest_unreachable() {
        Classification::DestinationUnreachable
    } else {
        return HopResult::unknown(ttl);
    };

    // The quoted Echo Request, not the outer header, identifies the probe
    if quotes_echo(&message, identifier, sequence) {
        HopResult::matched(ttl, reply.source, classification, rtt)
    } else {
        tracing::debug!(ttl, from = %reply.source, %classification, "error for another flow");
        HopResult::unknown(ttl)
    }
}

/// Whether an ICMP error quotes our Echo Request with this id/seq
fn quotes_echo(message: &IcmpMessage, identifier: u16, sequence: u16) -> bool {
    matches!(
        message.embedded.map(|e| e.transport),
        Some(EmbeddedTransport::Icmp {
            icmp_type: ICMP_ECHO_REQUEST,
            identifier: quoted_id,
            sequence: quoted_seq,
            ..
        }) if quoted_id == identifier && quoted_seq == sequence
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::codec::{IPPROTO_ICMP, IPPROTO_TCP};
    use crate::probe::fixtures;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    const TARGET: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
    const ROUTER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[derive(Default)]
    struct Recorded {
        ttls: Vec<u8>,
        sent: Vec<Vec<u8>>,
    }

    /// Replays canned replies, one per recv
    struct FakeChannel {
        replies: VecDeque<io::Result<Option<(Ipv4Addr, Vec<u8>)>>>,
        fail_send: bool,
        recorded: Arc<Mutex<Recorded>>,
    }

    impl FakeChannel {
        fn new(replies: Vec<io::Result<Option<(Ipv4Addr, Vec<u8>)>>>) -> Self {
            Self {
                replies: replies.into(),
                fail_send: false,
                recorded: Arc::default(),
            }
        }
    }

    impl IcmpChannel for FakeChannel {
        fn set_ttl(&mut self, ttl: u8) -> io::Result<()> {
            self.recorded.lock().unwrap().ttls.push(ttl);
            Ok(())
        }

        fn send_to(&mut self, packet: &[u8], _target: Ipv4Addr) -> io::Result<usize> {
            if self.fail_send {
                return Err(io::Error::new(io::ErrorKind::Other, "network unreachable"));
            }
            self.recorded.lock().unwrap().sent.push(packet.to_vec());
            Ok(packet.len())
        }

        fn recv(&mut self, _timeout: Duration) -> io::Result<Option<IcmpReply>> {
            match self.replies.pop_front() {
                Some(Ok(Some((source, data)))) => Ok(Some(IcmpReply {
                    source,
                    data,
                    received_at: Instant::now(),
                })),
                Some(Ok(None)) | None => Ok(None),
                Some(Err(e)) => Err(e),
            }
        }
    }

    fn reply(source: Ipv4Addr, data: Vec<u8>) -> IcmpReply {
        IcmpReply {
            source,
            data,
            received_at: Instant::now(),
        }
    }

    fn time_exceeded_for(identifier: u16, sequence: u16) -> Vec<u8> {
        let original = encode_echo_request(identifier, sequence, b"PING..");
        fixtures::time_exceeded(Ipv4Addr::new(192, 168, 1, 5), TARGET, IPPROTO_ICMP, &original)
    }

    fn prober(channel: FakeChannel) -> IcmpProber {
        IcmpProber::new(
            Box::new(channel),
            TARGET,
            0x1234,
            b"PING..".to_vec(),
            Duration::from_millis(50),
            Span::none(),
        )
    }

    #[test]
    fn test_matching_echo_reply() {
        let probe = Probe::echo(7, 0x1234, 7);
        let hop = classify_reply(&probe, &reply(TARGET, fixtures::echo_reply(0x1234, 7)));
        assert_eq!(hop.classification, Classification::EchoReply);
        assert!(hop.matched);
        assert_eq!(hop.responder, Some(TARGET));
        assert!(hop.rtt.is_some());
    }

    #[test]
    fn test_foreign_echo_reply_is_unknown() {
        let probe = Probe::echo(7, 0x1234, 7);
        let hop = classify_reply(&probe, &reply(TARGET, fixtures::echo_reply(0x9999, 7)));
        assert_eq!(hop.classification, Classification::Unknown);
        assert!(!hop.matched);
        assert!(hop.responder.is_none());

        let hop = classify_reply(&probe, &reply(TARGET, fixtures::echo_reply(0x1234, 6)));
        assert_eq!(hop.classification, Classification::Unknown);
    }

    #[test]
    fn test_time_exceeded_matches_on_embedded_ids() {
        let probe = Probe::echo(3, 0x1234, 3);

        let hop = classify_reply(&probe, &reply(ROUTER, time_exceeded_for(0x1234, 3)));
        assert_eq!(hop.classification, Classification::TimeExceeded);
        assert!(hop.matched);
        assert_eq!(hop.responder, Some(ROUTER));

        let hop = classify_reply(&probe, &reply(ROUTER, time_exceeded_for(0x1234, 4)));
        assert_eq!(hop.classification, Classification::Unknown);
        assert!(!hop.matched);

        let hop = classify_reply(&probe, &reply(ROUTER, time_exceeded_for(0x4321, 3)));
        assert_eq!(hop.classification, Classification::Unknown);
    }

    #[test]
    fn test_dest_unreachable_is_terminal() {
        let probe = Probe::echo(5, 0x1234, 5);
        let original = encode_echo_request(0x1234, 5, b"");
        let data = fixtures::dest_unreachable(TARGET, IPPROTO_ICMP, &original);

        let hop = classify_reply(&probe, &reply(ROUTER, data));
        assert_eq!(hop.classification, Classification::DestinationUnreachable);
        assert!(hop.matched);
        assert!(hop.classification.is_terminal());
    }

    #[test]
    fn test_dest_unreachable_for_other_flow_is_unknown() {
        let probe = Probe::echo(5, 0x1234, 5);

        let data = fixtures::dest_unreachable(Ipv4Addr::new(1, 2, 3, 4), IPPROTO_TCP, &[0u8; 8]);
        let hop = classify_reply(&probe, &reply(ROUTER, data));
        assert_eq!(hop.classification, Classification::Unknown);
        assert!(!hop.matched);
        assert!(hop.responder.is_none());

        // Our own identifier but an earlier sequence
        let original = encode_echo_request(0x1234, 4, b"");
        let data = fixtures::dest_unreachable(TARGET, IPPROTO_ICMP, &original);
        let hop = classify_reply(&probe, &reply(ROUTER, data));
        assert_eq!(hop.classification, Classification::Unknown);
    }

    #[test]
    fn test_malformed_reply_is_unknown() {
        let probe = Probe::echo(2, 0x1234, 2);
        let hop = classify_reply(&probe, &reply(ROUTER, vec![11, 0]));
        assert_eq!(hop.classification, Classification::Unknown);
        assert!(!hop.matched);
    }

    #[test]
    fn test_probe_sets_ttl_and_sequence() {
        let channel = FakeChannel::new(vec![Ok(Some((ROUTER, time_exceeded_for(0x1234, 4))))]);
        let recorded = channel.recorded.clone();
        let mut prober = prober(channel);
        assert_eq!(prober.identifier(), 0x1234);

        let hop = prober.probe(4);
        assert_eq!(hop.ttl, 4);
        assert_eq!(hop.classification, Classification::TimeExceeded);

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.ttls, vec![4]);
        let sent = decode_icmp(&recorded.sent[0]).unwrap();
        assert_eq!(sent.identifier, 0x1234);
        assert_eq!(sent.sequence, 4);
    }

    #[test]
    fn test_probe_timeout_and_errors_degrade() {
        let channel = FakeChannel::new(vec![
            Ok(None),
            Err(io::Error::new(io::ErrorKind::Other, "boom")),
        ]);
        let mut prober = prober(channel);

        assert_eq!(prober.probe(1).classification, Classification::Timeout);
        assert_eq!(prober.probe(2).classification, Classification::Timeout);
    }

    #[test]
    fn test_send_failure_is_timeout() {
        let mut channel = FakeChannel::new(vec![Ok(Some((TARGET, fixtures::echo_reply(0x1234, 1))))]);
        channel.fail_send = true;
        let mut prober = prober(channel);

        let hop = prober.probe(1);
        assert_eq!(hop.classification, Classification::Timeout);
        assert!(!hop.matched);
    }
}
