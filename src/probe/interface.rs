//! Interface selection for response capture.

use pnet::datalink::{self, NetworkInterface};
use std::net::IpAddr;

use crate::error::TraceError;

/// Interfaces that can carry replies from the internet: up, not loopback, with IPv4
pub fn is_capture_candidate(iface: &NetworkInterface) -> bool {
    iface.is_up() && !iface.is_loopback() && iface.ips.iter().any(|ip| ip.is_ipv4())
}

/// Frames on this interface start at the IP header (tun, ppp, wireguard)
pub fn frames_are_bare_ip(iface: &NetworkInterface) -> bool {
    iface.mac.is_none() || iface.is_point_to_point()
}

/// First IPv4 address assigned to the interface
pub fn ipv4_address(iface: &NetworkInterface) -> Option<std::net::Ipv4Addr> {
    iface.ips.iter().find_map(|net| match net.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    })
}

/// Look up a named interface.
///
/// Errors name the interfaces that do exist.
pub fn validate_interface(name: &str) -> Result<NetworkInterface, TraceError> {
    let interfaces = datalink::interfaces();
    if let Some(iface) = interfaces.iter().find(|i| i.name == name) {
        if ipv4_address(iface).is_none() {
            return Err(TraceError::Interface(format!(
                "interface '{}' has no IPv4 address",
                name
            )));
        }
        return Ok(iface.clone());
    }

    let available: Vec<_> = interfaces
        .iter()
        .filter(|i| !i.ips.is_empty())
        .map(|i| i.name.clone())
        .collect();

    Err(TraceError::Interface(format!(
        "interface '{}' not found. Available interfaces: {}",
        name,
        if available.is_empty() {
            "(none with IP addresses)".to_string()
        } else {
            available.join(", ")
        }
    )))
}

/// Interfaces to capture on: the named one, or every candidate
pub fn capture_interfaces(requested: Option<&str>) -> Result<Vec<NetworkInterface>, TraceError> {
    if let Some(name) = requested {
        return Ok(vec![validate_interface(name)?]);
    }

    let selected: Vec<_> = datalink::interfaces()
        .into_iter()
        .filter(is_capture_candidate)
        .collect();

    if selected.is_empty() {
        return Err(TraceError::Interface(
            "no active non-loopback IPv4 interface to capture on".into(),
        ));
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonexistent_interface() {
        let result = validate_interface("nonexistent_interface_12345");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_loopback_is_not_a_candidate() {
        for iface in datalink::interfaces() {
            if iface.is_loopback() {
                assert!(!is_capture_candidate(&iface));
            }
        }
    }
}
