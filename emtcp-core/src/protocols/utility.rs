//! Contains utilities for implementing protocols.

use super::ip::IpAddress;

/// A calculator for the one's complement checksum used by TCP and IP.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum(u16);

impl Checksum {
    /// Creates a new checksum calculator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `u16` to the checksum value.
    pub fn add_u16(&mut self, value: u16) {
        let (sum, carry) = self.0.overflowing_add(value);
        self.0 = sum + carry as u16;
    }

    /// Adds `u16` formed by two `u8`s to the checksum value.
    pub fn add_u8(&mut self, a: u8, b: u8) {
        self.add_u16(u16::from_be_bytes([a, b]));
    }

    /// Adds two `u16`s to the checksum value by splitting a `u32` in half.
    pub fn add_u32(&mut self, value: [u8; 4]) {
        self.add_u8(value[0], value[1]);
        self.add_u8(value[2], value[3]);
    }

    /// Adds a run of bytes two at a time. An odd final byte is padded with
    /// zero.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        let mut chunks = bytes.chunks_exact(2);
        for pair in &mut chunks {
            self.add_u8(pair[0], pair[1]);
        }
        if let [last] = chunks.remainder() {
            self.add_u8(*last, 0);
        }
    }

    /// Adds the IPv4 or IPv6 pseudo-header for a transport segment of
    /// `length` bytes.
    pub fn add_pseudo_header(
        &mut self,
        src: IpAddress,
        dst: IpAddress,
        protocol: u8,
        length: u32,
    ) {
        match (src, dst) {
            (IpAddress::V4(src), IpAddress::V4(dst)) => {
                self.add_u32(src.to_bytes());
                self.add_u32(dst.to_bytes());
                self.add_u8(0, protocol);
                // Callers bound IPv4 segments to 16 bits
                self.add_u16(length as u16);
            }
            (src, dst) => {
                self.add_bytes(&v6_bytes(src));
                self.add_bytes(&v6_bytes(dst));
                self.add_u32(length.to_be_bytes());
                self.add_u8(0, 0);
                self.add_u8(0, protocol);
            }
        }
    }

    /// Computes the final checksum value.
    pub fn as_u16(&self) -> u16 {
        !self.0
    }
}

/// IPv4 addresses in an IPv6 pseudo-header are written in their mapped form
fn v6_bytes(address: IpAddress) -> [u8; 16] {
    match address {
        IpAddress::V6(address) => address.to_bytes(),
        IpAddress::V4(address) => {
            let [a, b, c, d] = address.to_bytes();
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, a, b, c, d]
        }
    }
}

/// One end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoint {
    pub address: IpAddress,
    pub port: u16,
}

impl Endpoint {
    pub const fn new(address: IpAddress, port: u16) -> Self {
        Self { address, port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.address {
            IpAddress::V4(address) => write!(f, "{}:{}", address, self.port),
            IpAddress::V6(address) => write!(f, "[{}]:{}", address, self.port),
        }
    }
}

/// Both ends of a connection, seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Endpoints {
    pub local: Endpoint,
    pub remote: Endpoint,
}

impl Endpoints {
    pub const fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote }
    }

    pub const fn reverse(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::ip::Ipv4Address;

    #[test]
    fn rfc_1071_example() {
        // The worked example from RFC 1071 section 3
        let mut checksum = Checksum::new();
        checksum.add_bytes(&[0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7]);
        assert_eq!(checksum.as_u16(), !0xddf2);
    }

    #[test]
    fn odd_length_is_padded() {
        let mut odd = Checksum::new();
        odd.add_bytes(&[0xab, 0xcd, 0xef]);
        let mut padded = Checksum::new();
        padded.add_bytes(&[0xab, 0xcd, 0xef, 0x00]);
        assert_eq!(odd, padded);
    }

    #[test]
    fn pseudo_header_v4() {
        let src: IpAddress = Ipv4Address::new([10, 0, 0, 1]).into();
        let dst: IpAddress = Ipv4Address::new([10, 0, 0, 2]).into();
        let mut checksum = Checksum::new();
        checksum.add_pseudo_header(src, dst, 6, 20);
        let mut expected = Checksum::new();
        expected.add_bytes(&[10, 0, 0, 1, 10, 0, 0, 2, 0, 6, 0, 20]);
        assert_eq!(checksum, expected);
    }

    #[test]
    fn endpoints_reverse() {
        let a = Endpoint::new([1, 2, 3, 4].into(), 80);
        let b = Endpoint::new([5, 6, 7, 8].into(), 4000);
        let ends = Endpoints::new(a, b);
        assert_eq!(ends.reverse(), Endpoints::new(b, a));
        assert_eq!(a.to_string(), "1.2.3.4:80");
    }
}
