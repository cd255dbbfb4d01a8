use std::io::Write;

use crate::state::{HopResult, Session, SessionStatus};

/// Write one line per hop and a closing status line
pub fn generate_report<W: Write>(session: &Session, mut writer: W) -> std::io::Result<()> {
    writeln!(
        writer,
        "hoptrace to {} ({}), {}, {} hops max",
        session.target.original, session.target.resolved, session.mode, session.max_hops
    )?;
    writeln!(
        writer,
        "Started: {}",
        session.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    )?;
    writeln!(writer)?;

    for hop in &session.hops {
        writeln!(writer, "{}", format_hop(hop))?;
    }

    writeln!(writer)?;
    writeln!(writer, "{}", status_line(session))?;
    Ok(())
}

/// `ttl  address  classification  rtt  [ASN]`
pub fn format_hop(hop: &HopResult) -> String {
    let host = hop
        .responder
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "*".to_string());
    let rtt = hop
        .rtt
        .map(|rtt| format!("{:.1}ms", rtt.as_secs_f64() * 1000.0))
        .unwrap_or_else(|| "-".to_string());

    let mut line = format!(
        "{:>3}  {:<15}  {:<16}  {:>9}",
        hop.ttl,
        host,
        hop.classification.to_string(),
        rtt
    );
    if let Some(ref asn) = hop.asn {
        line.push_str(&format!("  AS{} {} ({})", asn.number, asn.name, asn.country));
    }
    line
}

pub fn status_line(session: &Session) -> String {
    match session.status {
        Some(SessionStatus::Reached) => match session.dest_ttl() {
            Some(ttl) => format!("Status: Reached at hop {}", ttl),
            None => "Status: Reached".to_string(),
        },
        Some(SessionStatus::Exhausted) => {
            format!("Status: Exhausted after {} hops", session.hops.len())
        }
        Some(SessionStatus::Aborted) => format!(
            "Status: Aborted ({})",
            session.abort_reason.as_deref().unwrap_or("unknown reason")
        ),
        None => "Status: running".to_string(),
    }
}

/// Generate report to string
pub fn generate_report_string(session: &Session) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail
    let _ = generate_report(session, &mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}
