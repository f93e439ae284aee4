//! IP address and prefix types with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IP address that can be either IPv4 or IPv6.
///
/// Serialized as its textual form so lease records stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IpAddress {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl IpAddress {
    /// Returns true if this is an IPv4 address.
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    /// Returns true if this is an IPv6 address.
    pub const fn is_ipv6(&self) -> bool {
        matches!(self, IpAddress::V6(_))
    }

    /// Returns true for 0.0.0.0 and ::.
    pub fn is_unspecified(&self) -> bool {
        match self {
            IpAddress::V4(addr) => addr.is_unspecified(),
            IpAddress::V6(addr) => addr.is_unspecified(),
        }
    }

    /// Returns the standard library representation.
    pub const fn to_std(&self) -> IpAddr {
        match self {
            IpAddress::V4(addr) => IpAddr::V4(*addr),
            IpAddress::V6(addr) => IpAddr::V6(*addr),
        }
    }

    fn to_bits(self) -> u128 {
        match self {
            IpAddress::V4(addr) => u32::from(addr) as u128,
            IpAddress::V6(addr) => u128::from(addr),
        }
    }

    const fn max_prefix_len(&self) -> u8 {
        match self {
            IpAddress::V4(_) => 32,
            IpAddress::V6(_) => 128,
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<IpAddr>()
            .map(IpAddress::from)
            .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
    }
}

impl TryFrom<String> for IpAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpAddress> for String {
    fn from(addr: IpAddress) -> Self {
        addr.to_string()
    }
}

impl From<IpAddr> for IpAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => IpAddress::V4(v4),
            IpAddr::V6(v6) => IpAddress::V6(v6),
        }
    }
}

impl From<IpAddress> for IpAddr {
    fn from(addr: IpAddress) -> Self {
        addr.to_std()
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(addr)
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(addr)
    }
}

/// An IP prefix in CIDR notation (e.g., 10.5.1.0/24 or 2001:db8:1::/64).
///
/// Equality compares address and length as given; use [`IpPrefix::network`]
/// to compare prefixes whose host bits may differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpPrefix {
    address: IpAddress,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new IP prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix length is invalid for the address type
    /// (>32 for IPv4, >128 for IPv6).
    pub fn new(address: IpAddress, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = address.max_prefix_len();
        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {} for address type",
                prefix_len, max_len
            )));
        }

        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    /// Returns the address this prefix was built from.
    pub const fn address(&self) -> &IpAddress {
        &self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Returns true if this is an IPv4 prefix.
    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    /// Returns true if this is an IPv6 prefix.
    pub const fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Returns true if this is the default route (0.0.0.0/0 or ::/0).
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Returns the same prefix with all host bits cleared.
    pub fn network(&self) -> IpPrefix {
        let width = self.address.max_prefix_len();
        let mask = mask_bits(width, self.prefix_len);
        let bits = self.address.to_bits() & mask;
        let address = match self.address {
            IpAddress::V4(_) => IpAddress::V4(Ipv4Addr::from(bits as u32)),
            IpAddress::V6(_) => IpAddress::V6(Ipv6Addr::from(bits)),
        };
        IpPrefix {
            address,
            prefix_len: self.prefix_len,
        }
    }

    /// The first host address of the network, keeping the prefix length
    /// (`10.5.1.0/24` gives `10.5.1.1/24`).
    pub fn first_host(&self) -> IpPrefix {
        let network = self.network();
        let bits = network.address.to_bits().wrapping_add(1);
        let address = match network.address {
            IpAddress::V4(_) => IpAddress::V4(Ipv4Addr::from(bits as u32)),
            IpAddress::V6(_) => IpAddress::V6(Ipv6Addr::from(bits)),
        };
        IpPrefix {
            address,
            prefix_len: self.prefix_len,
        }
    }

    /// Returns true if `addr` falls inside this prefix.
    pub fn contains(&self, addr: &IpAddress) -> bool {
        if self.address.is_ipv4() != addr.is_ipv4() {
            return false;
        }
        let mask = mask_bits(self.address.max_prefix_len(), self.prefix_len);
        (self.address.to_bits() & mask) == (addr.to_bits() & mask)
    }

    /// Returns true if `other` is fully covered by this prefix.
    pub fn covers(&self, other: &IpPrefix) -> bool {
        other.prefix_len >= self.prefix_len && self.contains(&other.address)
    }
}

fn mask_bits(width: u8, prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        return 0;
    }
    let all = if width == 128 {
        u128::MAX
    } else {
        (1u128 << width) - 1
    };
    all & !((1u128 << (width - prefix_len)).wrapping_sub(1))
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddress = addr_str.parse()?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

impl TryFrom<String> for IpPrefix {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<IpPrefix> for String {
    fn from(prefix: IpPrefix) -> Self {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ip_address_discrimination() {
        let v4: IpAddress = "10.0.0.1".parse().unwrap();
        assert!(v4.is_ipv4());
        assert!(!v4.is_ipv6());

        let v6: IpAddress = "::1".parse().unwrap();
        assert!(!v6.is_ipv4());
        assert!(v6.is_ipv6());
    }

    #[test]
    fn test_invalid_address() {
        assert_eq!(
            "10.0.0.256".parse::<IpAddress>(),
            Err(ParseError::InvalidIpAddress("10.0.0.256".to_string()))
        );
    }

    #[test]
    fn test_ip_prefix_parse() {
        let prefix: IpPrefix = "10.5.1.0/24".parse().unwrap();
        assert!(prefix.is_ipv4());
        assert_eq!(prefix.prefix_len(), 24);

        let v6_prefix: IpPrefix = "2001:db8::/32".parse().unwrap();
        assert!(v6_prefix.is_ipv6());
        assert_eq!(v6_prefix.prefix_len(), 32);
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
        assert!("10.0.0.0".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_network_clears_host_bits() {
        let prefix: IpPrefix = "10.5.1.17/24".parse().unwrap();
        assert_eq!(prefix.network().to_string(), "10.5.1.0/24");

        let v6: IpPrefix = "2001:db8::1/64".parse().unwrap();
        assert_eq!(v6.network().to_string(), "2001:db8::/64");

        let default: IpPrefix = "192.168.3.4/0".parse().unwrap();
        assert_eq!(default.network().to_string(), "0.0.0.0/0");
    }

    #[test]
    fn test_first_host() {
        let prefix: IpPrefix = "10.5.1.0/24".parse().unwrap();
        assert_eq!(prefix.first_host().to_string(), "10.5.1.1/24");

        let unaligned: IpPrefix = "10.5.1.77/24".parse().unwrap();
        assert_eq!(unaligned.first_host().to_string(), "10.5.1.1/24");

        let v6: IpPrefix = "fd00:5:1::/64".parse().unwrap();
        assert_eq!(v6.first_host().to_string(), "fd00:5:1::1/64");
    }

    #[test]
    fn test_contains_and_covers() {
        let network: IpPrefix = "10.5.0.0/16".parse().unwrap();
        assert!(network.contains(&"10.5.200.1".parse().unwrap()));
        assert!(!network.contains(&"10.6.0.1".parse().unwrap()));
        assert!(!network.contains(&"::1".parse().unwrap()));

        let lease: IpPrefix = "10.5.7.0/24".parse().unwrap();
        assert!(network.covers(&lease));
        assert!(!lease.covers(&network));
    }

    #[test]
    fn test_serde_as_string() {
        let prefix: IpPrefix = "10.5.1.0/24".parse().unwrap();
        let json = serde_json::to_string(&prefix).unwrap();
        assert_eq!(json, "\"10.5.1.0/24\"");
        let back: IpPrefix = serde_json::from_str(&json).unwrap();
        assert_eq!(back, prefix);

        let bad = serde_json::from_str::<IpAddress>("\"not-an-ip\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_display() {
        let prefix: IpPrefix = "192.168.0.0/16".parse().unwrap();
        assert_eq!(prefix.to_string(), "192.168.0.0/16");
    }
}
