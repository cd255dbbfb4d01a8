//! Error types for tracing and ASN enrichment.

use std::time::Duration;

/// Errors raised while tracing a path.
///
/// Only `Socket`, `Interface`, `Timeout` (TCP handoff) and `CaptureClosed` end a
/// session; the rest degrade to an unresolved hop.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("failed to resolve {target}: {reason}")]
    Resolution { target: String, reason: String },
    #[error("socket error: {0} (raw sockets usually require root or CAP_NET_RAW)")]
    Socket(#[source] std::io::Error),
    #[error("transmit failed at ttl {ttl}: {source}")]
    Transmit {
        ttl: u8,
        #[source]
        source: std::io::Error,
    },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("malformed packet: need {needed} bytes, got {got}")]
    MalformedPacket { needed: usize, got: usize },
    #[error("response capture stopped")]
    CaptureClosed,
    #[error("interface error: {0}")]
    Interface(String),
}

impl TraceError {
    pub(crate) fn malformed(needed: usize, got: usize) -> Self {
        Self::MalformedPacket { needed, got }
    }
}

/// Errors raised by the ASN table.
#[derive(Debug, thiserror::Error)]
pub enum AsnLookupError {
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),
    #[error("no ASN found for {0}")]
    NotFound(String),
    #[error("malformed ASN row {line}: {reason}")]
    MalformedRow { line: usize, reason: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
