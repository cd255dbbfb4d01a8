use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::config::{Config, ProbeProtocol};
use crate::error::TraceError;
use crate::probe::{
    IcmpChannel, IcmpProber, RawIcmpChannel, RawSynTransport, SynTransport, TcpProber,
    capture_interfaces, get_identifier, get_local_addr,
};
use crate::state::{Classification, HopResult, Session, SessionStatus, Target};
use crate::trace::capture::{
    CAPTURE_QUEUE_DEPTH, CaptureFilter, CaptureTask, CapturedPacket, ResponseCapture,
    spawn_readers,
};
use crate::trace::coordinator::coordinator;

/// The prober for the session's mode
pub enum Prober {
    Icmp(IcmpProber),
    Tcp(TcpProber),
}

impl Prober {
    /// Probe one TTL.
    ///
    /// ICMP probes block in place, so this must run on a multi-thread runtime.
    pub async fn probe(&mut self, ttl: u8) -> Result<HopResult, TraceError> {
        match self {
            Self::Icmp(prober) => Ok(tokio::task::block_in_place(|| prober.probe(ttl))),
            Self::Tcp(prober) => prober.probe(ttl).await,
        }
    }

    pub fn mode(&self) -> ProbeProtocol {
        match self {
            Self::Icmp(_) => ProbeProtocol::Icmp,
            Self::Tcp(_) => ProbeProtocol::Tcp,
        }
    }
}

/// Drives TTL 1..=max_hops and decides how the trace ends
pub struct TraceSession {
    prober: Prober,
    session: Session,
    cancel: CancellationToken,
    span: Span,
}

impl TraceSession {
    pub fn new(target: Target, max_hops: u8, prober: Prober, cancel: CancellationToken) -> Self {
        let span = session_span(&target, prober.mode());
        Self::with_span(target, max_hops, prober, cancel, span)
    }

    fn with_span(
        target: Target,
        max_hops: u8,
        prober: Prober,
        cancel: CancellationToken,
        span: Span,
    ) -> Self {
        let session = Session::new(target, prober.mode(), max_hops);
        Self {
            prober,
            session,
            cancel,
            span,
        }
    }

    /// ICMP mode over the given channel
    pub fn icmp(
        target: Target,
        config: &Config,
        channel: Box<dyn IcmpChannel>,
        cancel: CancellationToken,
    ) -> Self {
        let span = session_span(&target, ProbeProtocol::Icmp);
        let prober = IcmpProber::new(
            channel,
            target.resolved,
            get_identifier(),
            config.payload.as_bytes().to_vec(),
            config.probe_timeout,
            tracing::info_span!(parent: &span, "icmp"),
        );
        Self::with_span(target, config.max_hops, Prober::Icmp(prober), cancel, span)
    }

    /// TCP mode: the session plus the capture task that must run beside it.
    ///
    /// `source` is the local address used for the SYN checksum. The capture
    /// stops when the target answers or `cancel` fires.
    pub fn tcp(
        target: Target,
        config: &Config,
        source: Ipv4Addr,
        transport: Box<dyn SynTransport>,
        packets: mpsc::Receiver<CapturedPacket>,
        cancel: CancellationToken,
    ) -> (Self, ResponseCapture) {
        let span = session_span(&target, ProbeProtocol::Tcp);
        let (prober_side, capture_side) = coordinator(config.handoff_timeout);

        // The capture must report before the prober stops waiting for it
        let read_deadline = if config.probe_timeout < config.handoff_timeout {
            config.probe_timeout
        } else {
            let clamped = config.handoff_timeout / 2;
            tracing::warn!(
                "probe timeout {:?} is not below the handoff timeout {:?}, using {:?}",
                config.probe_timeout,
                config.handoff_timeout,
                clamped
            );
            clamped
        };

        let capture = ResponseCapture::new(
            packets,
            capture_side,
            target.resolved,
            read_deadline,
            cancel.child_token(),
            tracing::info_span!(parent: &span, "capture"),
        );
        let prober = TcpProber::new(
            transport,
            prober_side,
            source,
            SocketAddrV4::new(target.resolved, config.port),
            config.src_port_base,
            tracing::info_span!(parent: &span, "tcp"),
        );

        let session = Self::with_span(target, config.max_hops, Prober::Tcp(prober), cancel, span);
        (session, capture)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run the sweep to completion and return the finished record
    pub async fn run(mut self) -> Session {
        let span = self.span.clone();
        async move {
            tracing::info!(max_hops = self.session.max_hops, "trace started");

            for ttl in 1..=self.session.max_hops {
                if self.cancel.is_cancelled() {
                    self.session.abort("interrupted");
                    break;
                }

                let hop = match self.prober.probe(ttl).await {
                    Ok(hop) => hop,
                    Err(e) => {
                        let reason = if self.cancel.is_cancelled() {
                            "interrupted".to_string()
                        } else {
                            e.to_string()
                        };
                        tracing::warn!(ttl, "aborting trace: {}", reason);
                        self.session.abort(reason);
                        break;
                    }
                };

                let hop = self.session.record(hop).clone();
                if self.reaches_target(&hop) {
                    self.session.finish(SessionStatus::Reached);
                    break;
                }
                if hop.classification.is_terminal() {
                    let responder = hop
                        .responder
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "*".to_string());
                    self.session
                        .abort(format!("destination unreachable reported by {}", responder));
                    break;
                }
            }

            self.session.finish(SessionStatus::Exhausted);
            tracing::info!(
                status = ?self.session.status,
                hops = self.session.hops.len(),
                "trace finished"
            );
            self.session
        }
        .instrument(span)
        .await
    }

    fn reaches_target(&self, hop: &HopResult) -> bool {
        match self.prober.mode() {
            ProbeProtocol::Icmp => {
                hop.matched
                    && (hop.responder == Some(self.session.target.resolved)
                        || hop.classification == Classification::EchoReply)
            }
            ProbeProtocol::Tcp => hop.classification == Classification::TcpAck,
        }
    }
}

fn session_span(target: &Target, mode: ProbeProtocol) -> Span {
    tracing::info_span!("trace", target = %target.resolved, %mode)
}

/// Open live sockets (and the capture, in TCP mode) for a trace.
///
/// Must be called from within the tokio runtime. The returned capture, if
/// any, should be finished once the session has run.
pub fn launch(
    config: &Config,
    target: Target,
    cancel: CancellationToken,
) -> Result<(TraceSession, Option<CaptureTask>), TraceError> {
    let interface = config.interface.as_deref();

    match config.protocol {
        ProbeProtocol::Icmp => {
            let channel = RawIcmpChannel::open(interface)?;
            Ok((
                TraceSession::icmp(target, config, Box::new(channel), cancel),
                None,
            ))
        }
        ProbeProtocol::Tcp => {
            let interfaces = capture_interfaces(interface)?;
            let transport = RawSynTransport::open(interface)?;
            let source = get_local_addr(target.resolved)?;
            let filter = CaptureFilter::new(target.resolved);

            let (tx, rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
            let (session, capture) =
                TraceSession::tcp(target, config, source, Box::new(transport), rx, cancel);
            let stop = capture.done_token();
            let readers = spawn_readers(interfaces, filter, tx, stop.clone())?;

            let task = tokio::spawn(capture.run());
            Ok((session, Some(CaptureTask::new(task, readers, stop))))
        }
    }
}
