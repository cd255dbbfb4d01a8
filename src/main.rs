use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use hoptrace::cli::Args;
use hoptrace::config::{Config, FileConfig};
use hoptrace::error::TraceError;
use hoptrace::export::{export_json, generate_report};
use hoptrace::logging;
use hoptrace::lookup::AsnTable;
use hoptrace::state::{SessionStatus, Target};
use hoptrace::trace;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    logging::init(args.verbose);

    let file = match args.config {
        Some(ref path) => FileConfig::load(path)?,
        None => FileConfig::load_default(),
    };
    let config = Config::resolve(&file, &args)?;

    let resolved = resolve_target(&args.target)?;
    let target = Target::new(args.target.clone(), resolved);

    // Load the ASN table before probing so a bad path fails fast
    let asn_table = match config.asn_db {
        Some(ref path) => Some(
            AsnTable::open(path)
                .with_context(|| format!("Failed to load ASN table: {}", path.display()))?,
        ),
        None => None,
    };

    let cancel = CancellationToken::new();

    // Setup Ctrl+C handler
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        cancel_clone.cancel();
    });

    let (tracer, capture) = trace::launch(&config, target, cancel.clone())
        .context("Failed to start trace")?;
    let mut session = tracer.run().await;

    // Stops the capture readers if the trace ended any other way
    cancel.cancel();
    if let Some(capture) = capture {
        match capture.finish().await {
            Ok(summary) => tracing::debug!(exit = ?summary.exit, "capture stopped"),
            Err(e) => tracing::warn!("capture task failed: {:#}", e),
        }
    }

    if let Some(ref table) = asn_table {
        table.annotate(&mut session);
    }

    let stdout = std::io::stdout();
    if args.json {
        let mut out = stdout.lock();
        export_json(&session, &mut out)?;
        println!();
    } else {
        generate_report(&session, stdout.lock())?;
    }

    if session.status == Some(SessionStatus::Aborted) {
        std::process::exit(1);
    }
    Ok(())
}

/// Resolve a literal or hostname to its first IPv4 address
fn resolve_target(target: &str) -> Result<Ipv4Addr, TraceError> {
    let resolution = |reason: String| TraceError::Resolution {
        target: target.to_string(),
        reason,
    };

    match target.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => return Ok(ip),
        Ok(IpAddr::V6(_)) => return Err(resolution("IPv6 targets are not supported".into())),
        Err(_) => {}
    }

    let addrs = format!("{}:0", target)
        .to_socket_addrs()
        .map_err(|e| resolution(e.to_string()))?;

    addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| resolution("no IPv4 addresses found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_literal() {
        assert_eq!(
            resolve_target("93.184.216.34").unwrap(),
            Ipv4Addr::new(93, 184, 216, 34)
        );
    }

    #[test]
    fn test_resolve_rejects_ipv6() {
        let err = resolve_target("2001:db8::1").unwrap_err();
        assert!(matches!(err, TraceError::Resolution { .. }));
    }
}
