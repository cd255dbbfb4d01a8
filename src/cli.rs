use clap::Parser;
use std::path::PathBuf;

use crate::config::{parse_protocol, parse_seconds};

/// Traceroute over ICMP Echo or TCP SYN probes
#[derive(Parser, Debug, Clone)]
#[command(name = "hoptrace")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target host to trace (IPv4 address or hostname)
    #[arg(required = true)]
    pub target: String,

    /// Probe protocol (icmp, tcp) [default: icmp]
    #[arg(short = 'p', long = "proto")]
    pub protocol: Option<String>,

    /// Maximum number of hops; values below 1 fall back to 64
    #[arg(short = 'm', long = "max-hops", allow_negative_numbers = true)]
    pub max_hops: Option<i64>,

    /// Destination port for TCP probes [default: 80]
    #[arg(long = "port")]
    pub port: Option<u16>,

    /// Base source port for TCP probes (source port = base + ttl)
    #[arg(long = "src-port")]
    pub src_port: Option<u16>,

    /// Per-hop reply timeout in seconds [default: 5]
    #[arg(long = "timeout", allow_negative_numbers = true)]
    pub timeout: Option<f64>,

    /// Prober/capture handoff timeout in seconds, TCP mode [default: 20]
    #[arg(long = "handoff-timeout", allow_negative_numbers = true)]
    pub handoff_timeout: Option<f64>,

    /// Capture on (and bind probes to) this interface instead of all interfaces
    #[arg(short = 'i', long = "interface")]
    pub interface: Option<String>,

    /// Tab-separated ASN table used to annotate hops
    #[arg(long = "asn-db")]
    pub asn_db: Option<PathBuf>,

    /// Read settings from this TOML file instead of ~/.config/hoptrace/config.toml
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Output the finished session as JSON
    #[arg(long = "json")]
    pub json: bool,

    /// Enable internal event tracing
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Args {
    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref protocol) = self.protocol {
            if parse_protocol(protocol).is_none() {
                return Err(format!("Unknown protocol: {}. Use icmp or tcp", protocol));
            }
        }

        if let Some(secs) = self.timeout {
            parse_seconds("timeout", secs).map_err(|e| e.to_string())?;
        }

        if let Some(secs) = self.handoff_timeout {
            parse_seconds("handoff timeout", secs).map_err(|e| e.to_string())?;
        }

        if let Some(ref iface) = self.interface {
            if iface.is_empty() {
                return Err("Interface name cannot be empty".into());
            }
            // IFNAMSIZ on Linux is 16 including null terminator
            if iface.len() > 15 {
                return Err(format!("Interface name too long: {} (max 15 chars)", iface));
            }
        }

        Ok(())
    }
}
