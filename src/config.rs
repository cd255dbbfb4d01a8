use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;

/// Default maximum TTL
pub const DEFAULT_MAX_HOPS: u8 = 64;
/// Default TCP destination port
pub const DEFAULT_TCP_PORT: u16 = 80;
/// Default base for TTL-derived TCP source ports
pub const DEFAULT_SRC_PORT_BASE: u16 = 0xaa47;
/// Default per-hop reply deadline
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on each prober/capture handoff
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(20);
/// Default Echo Request payload
pub const DEFAULT_PAYLOAD: &str = "PING..";

/// Probe protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    #[default]
    Icmp,
    Tcp,
}

impl std::fmt::Display for ProbeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Icmp => f.write_str("icmp"),
            Self::Tcp => f.write_str("tcp"),
        }
    }
}

/// Runtime configuration derived from the config file and CLI args
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum TTL
    pub max_hops: u8,
    /// Probe protocol
    pub protocol: ProbeProtocol,
    /// Destination port for TCP probes
    pub port: u16,
    /// TCP source port = src_port_base + ttl
    pub src_port_base: u16,
    /// Per-hop reply deadline
    pub probe_timeout: Duration,
    /// Bound on each prober/capture handoff (TCP mode)
    pub handoff_timeout: Duration,
    /// Capture/bind interface (None = all interfaces)
    pub interface: Option<String>,
    /// Echo Request payload
    pub payload: String,
    /// Tab-separated ASN table for hop annotation
    pub asn_db: Option<PathBuf>,
    /// Debug-level event tracing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            protocol: ProbeProtocol::Icmp,
            port: DEFAULT_TCP_PORT,
            src_port_base: DEFAULT_SRC_PORT_BASE,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
            interface: None,
            payload: DEFAULT_PAYLOAD.to_string(),
            asn_db: None,
            verbose: false,
        }
    }
}

impl Config {
    /// Layer CLI args over the config file over the defaults.
    ///
    /// Fails when a timeout is not a usable number of seconds.
    pub fn resolve(file: &FileConfig, args: &Args) -> Result<Self> {
        let defaults = Self::default();

        let protocol = args
            .protocol
            .as_deref()
            .and_then(parse_protocol)
            .or(file.protocol)
            .unwrap_or(defaults.protocol);

        let max_hops = args
            .max_hops
            .or(file.max_hops)
            .map(coerce_max_hops)
            .unwrap_or(defaults.max_hops);

        let probe_timeout = match args.timeout.or(file.probe_timeout) {
            Some(secs) => parse_seconds("probe timeout", secs)?,
            None => defaults.probe_timeout,
        };
        let handoff_timeout = match args.handoff_timeout.or(file.handoff_timeout) {
            Some(secs) => parse_seconds("handoff timeout", secs)?,
            None => defaults.handoff_timeout,
        };

        Ok(Self {
            max_hops,
            protocol,
            port: args.port.or(file.port).unwrap_or(defaults.port),
            src_port_base: args
                .src_port
                .or(file.src_port_base)
                .unwrap_or(defaults.src_port_base),
            probe_timeout,
            handoff_timeout,
            interface: args.interface.clone().or_else(|| file.interface.clone()),
            payload: file.payload.clone().unwrap_or(defaults.payload),
            asn_db: args.asn_db.clone().or_else(|| file.asn_db.clone()),
            verbose: args.verbose,
        })
    }
}

/// Convert a seconds value from the CLI or config file
pub fn parse_seconds(name: &str, secs: f64) -> Result<Duration> {
    if secs.is_nan() || secs <= 0.0 {
        bail!("{} must be a positive number of seconds, got {}", name, secs);
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| anyhow!("{} of {} seconds is out of range: {}", name, secs, e))
}

/// Parse a protocol name (case-insensitive)
pub fn parse_protocol(name: &str) -> Option<ProbeProtocol> {
    match name.to_lowercase().as_str() {
        "icmp" => Some(ProbeProtocol::Icmp),
        "tcp" => Some(ProbeProtocol::Tcp),
        _ => None,
    }
}

/// Non-positive hop counts fall back to the default; TTL is capped at 255
pub fn coerce_max_hops(requested: i64) -> u8 {
    if requested < 1 {
        tracing::warn!(requested, "invalid number of hops, using {}", DEFAULT_MAX_HOPS);
        DEFAULT_MAX_HOPS
    } else {
        requested.min(u8::MAX as i64) as u8
    }
}

/// Optional settings read from a TOML file.
///
/// Looked up at ~/.config/hoptrace/config.toml unless `--config` names a file.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub max_hops: Option<i64>,
    pub protocol: Option<ProbeProtocol>,
    pub port: Option<u16>,
    pub src_port_base: Option<u16>,
    /// Seconds
    pub probe_timeout: Option<f64>,
    /// Seconds
    pub handoff_timeout: Option<f64>,
    pub interface: Option<String>,
    pub payload: Option<String>,
    pub asn_db: Option<PathBuf>,
}

impl FileConfig {
    /// Get config file path: ~/.config/hoptrace/config.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("hoptrace").join("config.toml"))
    }

    /// Load an explicitly requested file; errors are reported to the caller
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load the default file (returns default if missing, warns if invalid)
    pub fn load_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("ignoring config file: {:#}", e);
                Self::default()
            }
        }
    }
}
