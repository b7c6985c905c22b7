//! The TCP engine and the network-layer pieces it depends on.

pub mod ip;
pub use ip::{IpAddress, IpLayer, Ipv4Address, Ipv6Address};

pub mod tap;
pub use tap::Tap;

pub mod tcp;
pub use tcp::Tcp;

pub mod utility;
pub use utility::{Endpoint, Endpoints};
