//! Endpoint addressing types.
//!
//! An [`Endpoint`] is the unit of addressing for the RPC layer: a
//! [`NetworkAddress`] naming a peer process plus a 128-bit [`UID`] token
//! naming a receiver within that process. Tokens are globally unique; a
//! handle is usable iff its endpoint carries a non-zero token.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// 128-bit unique identifier for a receiver.
///
/// A default-constructed `UID` is the zero token, which is *invalid*: it
/// marks a local handle whose endpoint has not been registered yet.
/// Well-known tokens are ordinary `UID`s whose value the server operator
/// fixes at construction time so clients can address the receiver without
/// a prior introduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UID {
    /// High 64 bits.
    pub first: u64,
    /// Low 64 bits.
    pub second: u64,
}

impl UID {
    /// Create a UID from its two halves.
    pub const fn new(first: u64, second: u64) -> Self {
        Self { first, second }
    }

    /// A token is valid iff it is non-zero.
    pub const fn is_valid(&self) -> bool {
        self.first != 0 || self.second != 0
    }
}

impl std::fmt::Display for UID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.first, self.second)
    }
}

/// Address flag bits.
pub mod flags {
    /// Connection uses TLS.
    pub const FLAG_TLS: u16 = 1;
    /// Address is publicly routable.
    pub const FLAG_PUBLIC: u16 = 2;
}

/// Network address of a peer process: IP, port, and flag bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    /// IPv4 or IPv6 address.
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
    /// Flag bits, see [`flags`].
    pub flags: u16,
}

impl NetworkAddress {
    /// Create an address with no flags set.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port, flags: 0 }
    }

    /// Create an address with explicit flags.
    pub fn with_flags(ip: IpAddr, port: u16, flags: u16) -> Self {
        Self { ip, port, flags }
    }

    /// Whether this address can actually be reached by a peer.
    ///
    /// The all-zero address (unspecified IP, port 0) is the placeholder a
    /// process without a listening socket hands out; handles bound to it
    /// must never be serialized onto the wire.
    pub fn is_valid(&self) -> bool {
        !self.ip.is_unspecified() || self.port != 0
    }

    /// Whether the connection uses TLS.
    pub fn is_tls(&self) -> bool {
        self.flags & flags::FLAG_TLS != 0
    }

    /// Whether the address is publicly routable.
    pub fn is_public(&self) -> bool {
        self.flags & flags::FLAG_PUBLIC != 0
    }

    /// Parse an address from `ip:port` or `[ipv6]:port` notation.
    ///
    /// # Errors
    ///
    /// Returns an error if either component fails to parse.
    pub fn parse(s: &str) -> Result<Self, NetworkAddressParseError> {
        if let Some(bracket_end) = s.rfind(']') {
            if !s.starts_with('[') {
                return Err(NetworkAddressParseError::InvalidIp);
            }
            let ip: IpAddr = s[1..bracket_end]
                .parse()
                .map_err(|_| NetworkAddressParseError::InvalidIp)?;
            let port: u16 = s
                .get(bracket_end + 2..)
                .ok_or(NetworkAddressParseError::MissingPort)?
                .parse()
                .map_err(|_| NetworkAddressParseError::InvalidPort)?;
            Ok(Self::new(ip, port))
        } else {
            let (ip_str, port_str) = s
                .rsplit_once(':')
                .ok_or(NetworkAddressParseError::MissingPort)?;
            let ip: IpAddr = ip_str
                .parse()
                .map_err(|_| NetworkAddressParseError::InvalidIp)?;
            let port: u16 = port_str
                .parse()
                .map_err(|_| NetworkAddressParseError::InvalidPort)?;
            Ok(Self::new(ip, port))
        }
    }
}

impl std::fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

/// Error parsing a [`NetworkAddress`] from a string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkAddressParseError {
    /// The IP component could not be parsed.
    #[error("invalid IP address")]
    InvalidIp,
    /// The port component could not be parsed.
    #[error("invalid port number")]
    InvalidPort,
    /// No `:` separator found.
    #[error("missing port separator")]
    MissingPort,
}

/// A complete message destination: peer address plus receiver token.
///
/// At any moment an endpoint plays one of two roles: *local* (a receiver
/// for its token is registered in this process) or *remote* (a handle here
/// refers to a receiver elsewhere). The role lives in the handle that owns
/// the endpoint, not in the endpoint value itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Address of the process hosting the receiver.
    pub address: NetworkAddress,
    /// Token naming the receiver within that process.
    pub token: UID,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(address: NetworkAddress, token: UID) -> Self {
        Self { address, token }
    }

    /// An endpoint is valid iff its token is non-zero.
    pub fn is_valid(&self) -> bool {
        self.token.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn default_uid_is_invalid() {
        assert!(!UID::default().is_valid());
        assert!(UID::new(0, 1).is_valid());
        assert!(UID::new(1, 0).is_valid());
    }

    #[test]
    fn uid_display_is_fixed_width_hex() {
        let uid = UID::new(0x123456789ABCDEF0, 0xFEDCBA9876543210);
        assert_eq!(uid.to_string(), "123456789abcdef0fedcba9876543210");
        assert_eq!(UID::new(0, 5).to_string(), "00000000000000000000000000000005");
    }

    #[test]
    fn address_validity() {
        let unreachable = NetworkAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        assert!(!unreachable.is_valid());

        let routable = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500);
        assert!(routable.is_valid());

        // A bound port on the wildcard IP is still reachable.
        let wildcard = NetworkAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4500);
        assert!(wildcard.is_valid());
    }

    #[test]
    fn address_parse_and_display() {
        let v4 = NetworkAddress::parse("192.168.1.7:4500").expect("parse v4");
        assert_eq!(v4.to_string(), "192.168.1.7:4500");

        let v6 = NetworkAddress::parse("[::1]:4500").expect("parse v6");
        assert_eq!(v6.ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(v6.to_string(), "[::1]:4500");

        assert!(NetworkAddress::parse("no-port").is_err());
        assert!(NetworkAddress::parse("10.0.0.1:zzz").is_err());
        assert!(NetworkAddress::parse("not-an-ip:80").is_err());
    }

    #[test]
    fn address_flags() {
        let addr = NetworkAddress::with_flags(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            4500,
            flags::FLAG_TLS | flags::FLAG_PUBLIC,
        );
        assert!(addr.is_tls());
        assert!(addr.is_public());
    }

    #[test]
    fn endpoint_validity_follows_token() {
        let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500);
        assert!(!Endpoint::new(addr.clone(), UID::default()).is_valid());
        assert!(Endpoint::new(addr, UID::new(1, 2)).is_valid());
    }

    #[test]
    fn endpoint_serde_roundtrip() {
        let addr = NetworkAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500);
        let endpoint = Endpoint::new(addr, UID::new(100, 200));
        let json = serde_json::to_string(&endpoint).expect("serialize");
        let decoded: Endpoint = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(endpoint, decoded);
    }
}
