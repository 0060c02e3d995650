//! Endpoint / Address (C9): an immutable socket-address value used to drive
//! CM resolution. This wraps [`std::net::SocketAddr`] rather than
//! reimplementing address-family handling — the external Endpoint parser
//! contract in spec §6 is satisfied by `FromStr`/`Display`, which is exactly
//! what the fixed-contract collaborator is supposed to provide.

use std::fmt;
use std::net::{AddrParseError, IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Address family of an [`Endpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

/// An immutable (family, host, port) value, constructed either from parts or
/// from a textual `"host:port"` representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Endpoint {
        Endpoint(SocketAddr::new(ip, port))
    }

    pub fn v4(host: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint(SocketAddr::new(IpAddr::V4(host), port))
    }

    pub fn v6(host: Ipv6Addr, port: u16) -> Endpoint {
        Endpoint(SocketAddr::new(IpAddr::V6(host), port))
    }

    pub fn family(&self) -> Family {
        match self.0.ip() {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl FromStr for Endpoint {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Endpoint)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(ep: Endpoint) -> SocketAddr {
        ep.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn text_roundtrip_v4() {
        let ep: Endpoint = "127.0.0.1:13265".parse().unwrap();
        assert_eq!(ep.family(), Family::V4);
        assert_eq!(ep.port(), 13265);
        assert_eq!(ep.to_string(), "127.0.0.1:13265");
    }

    #[test]
    fn text_roundtrip_v6() {
        let ep: Endpoint = "[::1]:9000".parse().unwrap();
        assert_eq!(ep.family(), Family::V6);
        assert_eq!(ep.port(), 9000);
        assert_eq!(ep.to_string(), "[::1]:9000");
    }

    #[test]
    fn parts_constructors_match_text() {
        let ep = Endpoint::v4(Ipv4Addr::new(10, 0, 0, 1), 4791);
        assert_eq!(ep, "10.0.0.1:4791".parse().unwrap());
    }
}
