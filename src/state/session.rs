use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::config::ProbeProtocol;

/// Value that ties a reply back to the probe that caused it
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum CorrelationTag {
    /// ICMP Echo identifier and sequence
    Echo { identifier: u16, sequence: u16 },
    /// TCP source port derived from the TTL
    SourcePort(u16),
}

/// A single probe, created just before transmission
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub ttl: u8,
    pub tag: CorrelationTag,
    pub sent_at: Instant,
    pub protocol: ProbeProtocol,
    /// Initial sequence number of a TCP SYN probe
    pub initial_seq: Option<u32>,
}

impl Probe {
    pub fn echo(ttl: u8, identifier: u16, sequence: u16) -> Self {
        Self {
            ttl,
            tag: CorrelationTag::Echo {
                identifier,
                sequence,
            },
            sent_at: Instant::now(),
            protocol: ProbeProtocol::Icmp,
            initial_seq: None,
        }
    }

    pub fn syn(ttl: u8, src_port: u16, initial_seq: u32) -> Self {
        Self {
            ttl,
            tag: CorrelationTag::SourcePort(src_port),
            sent_at: Instant::now(),
            protocol: ProbeProtocol::Tcp,
            initial_seq: Some(initial_seq),
        }
    }

    /// Time elapsed between transmission and `at`
    pub fn rtt_at(&self, at: Instant) -> Duration {
        at.saturating_duration_since(self.sent_at)
    }
}

/// How a hop's reply (or lack of one) was interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    EchoReply,
    TimeExceeded,
    DestinationUnreachable,
    TcpAck,
    Unknown,
    Timeout,
}

impl Classification {
    /// A classification after which no further TTLs are probed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::EchoReply | Self::DestinationUnreachable | Self::TcpAck
        )
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::EchoReply => "echo-reply",
            Self::TimeExceeded => "time-exceeded",
            Self::DestinationUnreachable => "dest-unreachable",
            Self::TcpAck => "syn-ack",
            Self::Unknown => "unknown",
            Self::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

/// ASN information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsnInfo {
    pub number: u32,
    pub country: String,
    pub name: String,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
}

/// Outcome of probing a single TTL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopResult {
    pub ttl: u8,
    pub responder: Option<Ipv4Addr>,
    pub classification: Classification,
    pub matched: bool,
    #[serde(with = "duration_serde::option")]
    pub rtt: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<AsnInfo>,
}

impl HopResult {
    /// A reply that was correlated to the active probe
    pub fn matched(
        ttl: u8,
        responder: Ipv4Addr,
        classification: Classification,
        rtt: Duration,
    ) -> Self {
        Self {
            ttl,
            responder: Some(responder),
            classification,
            matched: true,
            rtt: Some(rtt),
            asn: None,
        }
    }

    /// A packet arrived but could not be tied to the active probe
    pub fn unknown(ttl: u8) -> Self {
        Self {
            ttl,
            responder: None,
            classification: Classification::Unknown,
            matched: false,
            rtt: None,
            asn: None,
        }
    }

    /// Nothing arrived before the deadline (or the probe never left)
    pub fn timeout(ttl: u8) -> Self {
        Self {
            ttl,
            responder: None,
            classification: Classification::Timeout,
            matched: false,
            rtt: None,
            asn: None,
        }
    }
}

/// Final state of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Reached,
    Exhausted,
    Aborted,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Reached => "Reached",
            Self::Exhausted => "Exhausted",
            Self::Aborted => "Aborted",
        };
        f.write_str(label)
    }
}

/// Target being traced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub original: String,
    pub resolved: Ipv4Addr,
}

impl Target {
    pub fn new(original: String, resolved: Ipv4Addr) -> Self {
        Self { original, resolved }
    }
}

/// Accumulated results of one trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub target: Target,
    pub mode: ProbeProtocol,
    pub max_hops: u8,
    pub hops: Vec<HopResult>,
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new(target: Target, mode: ProbeProtocol, max_hops: u8) -> Self {
        Self {
            target,
            mode,
            max_hops,
            hops: Vec::with_capacity(max_hops as usize),
            status: None,
            abort_reason: None,
            started_at: Utc::now(),
        }
    }

    /// TTL the next hop result must carry; saturates at 255
    pub fn next_ttl(&self) -> u8 {
        u8::try_from(self.hops.len() + 1).unwrap_or(u8::MAX)
    }

    /// Append the result for the next TTL.
    ///
    /// The result's TTL is forced to `next_ttl()` so the sequence stays
    /// contiguous and 1-indexed.
    pub fn record(&mut self, mut hop: HopResult) -> &HopResult {
        hop.ttl = self.next_ttl();
        self.hops.push(hop);
        &self.hops[self.hops.len() - 1]
    }

    pub fn hop(&self, ttl: u8) -> Option<&HopResult> {
        if ttl == 0 {
            return None;
        }
        self.hops.get(ttl as usize - 1)
    }

    pub fn finish(&mut self, status: SessionStatus) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        if self.status.is_none() {
            self.status = Some(SessionStatus::Aborted);
            self.abort_reason = Some(reason.into());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    /// TTL at which the target answered, if it did
    pub fn dest_ttl(&self) -> Option<u8> {
        match self.status {
            Some(SessionStatus::Reached) => self.hops.last().map(|h| h.ttl),
            _ => None,
        }
    }
}

/// Serde helpers for Duration (seconds as f64)
pub(crate) mod duration_serde {
    pub mod option {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration.map(|d| d.as_secs_f64()).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let secs = Option::<f64>::deserialize(deserializer)?;
            Ok(secs.map(Duration::from_secs_f64))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Session {
        let target = Target::new("8.8.8.8".to_string(), Ipv4Addr::new(8, 8, 8, 8));
        Session::new(target, ProbeProtocol::Icmp, 30)
    }

    #[test]
    fn test_record_keeps_ttls_contiguous() {
        let mut session = test_session();
        session.record(HopResult::timeout(7));
        session.record(HopResult::unknown(1));
        session.record(HopResult::timeout(3));

        let ttls: Vec<u8> = session.hops.iter().map(|h| h.ttl).collect();
        assert_eq!(ttls, vec![1, 2, 3]);
        assert_eq!(session.next_ttl(), 4);
    }

    #[test]
    fn test_next_ttl_saturates_on_full_session() {
        let mut session = test_session();
        for ttl in 1..=255u8 {
            session.record(HopResult::timeout(ttl));
        }
        assert_eq!(session.hops.len(), 255);
        assert_eq!(session.hops[254].ttl, 255);
        assert_eq!(session.next_ttl(), u8::MAX);
    }

    #[test]
    fn test_hop_lookup() {
        let mut session = test_session();
        let router = Ipv4Addr::new(10, 0, 0, 1);
        session.record(HopResult::matched(
            1,
            router,
            Classification::TimeExceeded,
            Duration::from_millis(3),
        ));

        assert!(session.hop(0).is_none());
        assert_eq!(session.hop(1).and_then(|h| h.responder), Some(router));
        assert!(session.hop(2).is_none());
    }

    #[test]
    fn test_status_is_set_once() {
        let mut session = test_session();
        session.abort("handoff timed out");
        session.finish(SessionStatus::Exhausted);

        assert_eq!(session.status, Some(SessionStatus::Aborted));
        assert_eq!(session.abort_reason.as_deref(), Some("handoff timed out"));
    }

    #[test]
    fn test_dest_ttl_only_when_reached() {
        let mut session = test_session();
        let target = session.target.resolved;
        session.record(HopResult::timeout(1));
        session.record(HopResult::matched(
            2,
            target,
            Classification::EchoReply,
            Duration::from_millis(12),
        ));
        assert_eq!(session.dest_ttl(), None);

        session.finish(SessionStatus::Reached);
        assert_eq!(session.dest_ttl(), Some(2));
    }

    #[test]
    fn test_terminal_classifications() {
        assert!(Classification::EchoReply.is_terminal());
        assert!(Classification::TcpAck.is_terminal());
        assert!(Classification::DestinationUnreachable.is_terminal());
        assert!(!Classification::TimeExceeded.is_terminal());
        assert!(!Classification::Unknown.is_terminal());
        assert!(!Classification::Timeout.is_terminal());
    }

    #[test]
    fn test_session_json_roundtrip() {
        let mut session = test_session();
        session.record(HopResult::matched(
            1,
            Ipv4Addr::new(192, 168, 1, 1),
            Classification::TimeExceeded,
            Duration::from_millis(4),
        ));
        session.record(HopResult::timeout(2));
        session.finish(SessionStatus::Exhausted);

        let json = serde_json::to_string(&session).unwrap();
        let loaded: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.hops, session.hops);
        assert_eq!(loaded.status, Some(SessionStatus::Exhausted));
    }
}
