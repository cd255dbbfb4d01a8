pub mod asn;

pub use asn::*;

/// Strip control characters so table text cannot inject terminal escapes.
pub(crate) fn sanitize_display(s: &str) -> String {
    s.chars().filter(|c| !c.is_control()).collect()
}
