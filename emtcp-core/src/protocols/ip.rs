//! Network-layer addresses and the interface TCP transmits through.
//!
//! Routing, fragmentation and link resolution live outside of this crate.
//! The engine only needs to ask which local address reaches a peer and to
//! hand a finished segment down, which is what [`IpLayer`] captures.

use std::fmt::{self, Display};
use thiserror::Error as ThisError;

/// The IP protocol number of TCP
pub const TCP_PROTOCOL: u8 = 6;

/// An IPv4 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Address([u8; 4]);

impl Ipv4Address {
    /// The address `0.0.0.0`.
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);

    /// The address `127.0.0.1`.
    pub const LOCALHOST: Self = Self([127, 0, 0, 1]);

    /// Creates a new address.
    pub const fn new(address: [u8; 4]) -> Self {
        Self(address)
    }

    /// Gets the address as a `[u8; 4]`.
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0
    }
}

impl Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(n: [u8; 4]) -> Self {
        Self(n)
    }
}

impl From<u32> for Ipv4Address {
    fn from(n: u32) -> Self {
        Self(n.to_be_bytes())
    }
}

impl From<Ipv4Address> for [u8; 4] {
    fn from(address: Ipv4Address) -> Self {
        address.0
    }
}

/// An IPv6 address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv6Address([u8; 16]);

impl Ipv6Address {
    /// The address `::`.
    pub const UNSPECIFIED: Self = Self([0; 16]);

    /// The address `::1`.
    pub const LOCALHOST: Self = Self([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    /// Creates a new address.
    pub const fn new(address: [u8; 16]) -> Self {
        Self(address)
    }

    /// Gets the address as a `[u8; 16]`.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0
    }
}

impl Display for Ipv6Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.0.chunks(2).enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:x}", u16::from_be_bytes([pair[0], pair[1]]))?;
        }
        Ok(())
    }
}

impl From<[u8; 16]> for Ipv6Address {
    fn from(n: [u8; 16]) -> Self {
        Self(n)
    }
}

/// Either kind of IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpAddress {
    V4(Ipv4Address),
    V6(Ipv6Address),
}

impl IpAddress {
    /// Whether this is the all-zeroes address of its family
    pub fn is_unspecified(&self) -> bool {
        match self {
            IpAddress::V4(address) => *address == Ipv4Address::UNSPECIFIED,
            IpAddress::V6(address) => *address == Ipv6Address::UNSPECIFIED,
        }
    }

    /// Whether both addresses belong to the same family
    pub fn same_family(&self, other: &IpAddress) -> bool {
        matches!(
            (self, other),
            (IpAddress::V4(_), IpAddress::V4(_)) | (IpAddress::V6(_), IpAddress::V6(_))
        )
    }
}

impl Default for IpAddress {
    fn default() -> Self {
        IpAddress::V4(Ipv4Address::UNSPECIFIED)
    }
}

impl Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(address) => address.fmt(f),
            IpAddress::V6(address) => address.fmt(f),
        }
    }
}

impl From<Ipv4Address> for IpAddress {
    fn from(address: Ipv4Address) -> Self {
        IpAddress::V4(address)
    }
}

impl From<Ipv6Address> for IpAddress {
    fn from(address: Ipv6Address) -> Self {
        IpAddress::V6(address)
    }
}

impl From<[u8; 4]> for IpAddress {
    fn from(address: [u8; 4]) -> Self {
        IpAddress::V4(address.into())
    }
}

/// The network layer as seen from TCP.
pub trait IpLayer {
    /// Finds the local address that traffic to `remote` leaves from.
    fn resolve_route(&self, remote: IpAddress) -> Result<IpAddress, RouteError>;

    /// Hands a serialized segment to the network layer for delivery. `tos`
    /// goes into the type of service field of an IPv4 header or the traffic
    /// class of an IPv6 header.
    fn send(
        &mut self,
        local: IpAddress,
        remote: IpAddress,
        protocol: u8,
        tos: u8,
        segment: Vec<u8>,
    ) -> Result<(), SendError>;
}

/// No route leads to the requested address
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
#[error("No route to {0}")]
pub struct RouteError(pub IpAddress);

/// The network layer refused a segment
#[derive(Debug, ThisError, PartialEq, Eq, Clone, Copy)]
pub enum SendError {
    #[error("No route to {0}")]
    NoRoute(IpAddress),
    #[error("The link is down")]
    LinkDown,
}
