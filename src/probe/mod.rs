pub mod codec;
pub mod icmp;
pub mod interface;
pub mod socket;
pub mod tcp;

#[cfg(test)]
pub(crate) mod fixtures;

pub use codec::*;
pub use icmp::*;
pub use interface::*;
pub use socket::*;
pub use tcp::*;
