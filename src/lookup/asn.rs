//! Offline ASN lookup over an ip2asn-style range table.
//!
//! Rows are `range_start \t range_end \t asn \t country \t name`, one per line.
//! The table is loaded fully, sorted by range start and searched by binary
//! search on the integer form of the address.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::Ipv4Addr;
use std::path::Path;

use super::sanitize_display;
use crate::error::AsnLookupError;
use crate::state::{AsnInfo, Session};

/// ASN 0 marks unrouted space in ip2asn tables
const NOT_ROUTED: u32 = 0;

#[derive(Debug, Clone)]
struct AsnRange {
    start: u32,
    end: u32,
    info: AsnInfo,
}

/// Sorted, non-overlapping address ranges with their origin AS
#[derive(Debug, Default)]
pub struct AsnTable {
    ranges: Vec<AsnRange>,
}

impl AsnTable {
    pub fn open(path: &Path) -> Result<Self, AsnLookupError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parse every row; a malformed row fails the whole load with its line number
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, AsnLookupError> {
        let mut ranges = Vec::new();

        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            ranges.push(parse_row(index + 1, line)?);
        }

        ranges.sort_by_key(|r| r.start);
        tracing::debug!(ranges = ranges.len(), "ASN table loaded");
        Ok(Self { ranges })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Find the AS announcing a dotted-quad address
    pub fn find(&self, ip: &str) -> Result<AsnInfo, AsnLookupError> {
        let addr: Ipv4Addr = ip
            .trim()
            .parse()
            .map_err(|_| AsnLookupError::InvalidAddress(ip.to_string()))?;
        self.lookup(addr)
            .cloned()
            .ok_or_else(|| AsnLookupError::NotFound(ip.to_string()))
    }

    pub fn lookup(&self, addr: Ipv4Addr) -> Option<&AsnInfo> {
        let key = u32::from(addr);
        // First range starting after the address; the candidate is just before it
        let idx = self.ranges.partition_point(|r| r.start <= key);
        let range = self.ranges.get(idx.checked_sub(1)?)?;

        if key <= range.end && range.info.number != NOT_ROUTED {
            Some(&range.info)
        } else {
            None
        }
    }

    /// Attach ASN info to every hop with a known responder
    pub fn annotate(&self, session: &mut Session) {
        for hop in &mut session.hops {
            if let Some(responder) = hop.responder {
                hop.asn = self.lookup(responder).cloned();
            }
        }
    }
}

fn parse_row(line: usize, row: &str) -> Result<AsnRange, AsnLookupError> {
    let malformed = |reason: String| AsnLookupError::MalformedRow { line, reason };

    let fields: Vec<&str> = row.split('\t').map(str::trim).collect();
    if fields.len() < 5 {
        return Err(malformed(format!("expected 5 fields, found {}", fields.len())));
    }

    let start: Ipv4Addr = fields[0]
        .parse()
        .map_err(|_| malformed(format!("bad range start '{}'", fields[0])))?;
    let end: Ipv4Addr = fields[1]
        .parse()
        .map_err(|_| malformed(format!("bad range end '{}'", fields[1])))?;
    if u32::from(end) < u32::from(start) {
        return Err(malformed(format!("range end {} precedes start {}", end, start)));
    }
    let number: u32 = fields[2]
        .trim_start_matches("AS")
        .parse()
        .map_err(|_| malformed(format!("bad AS number '{}'", fields[2])))?;

    Ok(AsnRange {
        start: u32::from(start),
        end: u32::from(end),
        info: AsnInfo {
            number,
            country: sanitize_display(fields[3]),
            name: sanitize_display(fields[4]),
            range_start: start,
            range_end: end,
        },
    })
}
