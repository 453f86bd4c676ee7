//! Wire address representation
//!
//! A tagged address (none / IPv4 / IPv6) with a host-order port. The
//! data plane keys everything on IPv4; IPv6 is parsed and formatted by
//! the utilities but never enters the session tables.

use crate::error::ProxyError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// Maximum length of `address_data` output: 16 IPv6 bytes + 2 port bytes.
pub const MAX_ADDRESS_DATA_BYTES: usize = 18;

/// Tagged network address. Equality is structural on the active variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Address {
    #[default]
    None,
    Ipv4 {
        ip: [u8; 4],
        port: u16,
    },
    Ipv6 {
        ip: [u16; 8],
        port: u16,
    },
}

impl Address {
    /// Shorthand IPv4 constructor.
    #[inline]
    #[must_use]
    pub const fn ipv4(ip: [u8; 4], port: u16) -> Self {
        Address::Ipv4 { ip, port }
    }

    #[inline]
    #[must_use]
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, Address::Ipv4 { .. })
    }

    #[inline]
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Address::None)
    }

    #[inline]
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Address::None => 0,
            Address::Ipv4 { port, .. } | Address::Ipv6 { port, .. } => *port,
        }
    }

    /// The byte string hashed by the packet filters: IP bytes followed
    /// by the port in little-endian. Returns the number of bytes
    /// written (6 for IPv4, 18 for IPv6, 0 for none).
    pub fn address_data(&self, out: &mut [u8; MAX_ADDRESS_DATA_BYTES]) -> usize {
        match self {
            Address::None => 0,
            Address::Ipv4 { ip, port } => {
                out[..4].copy_from_slice(ip);
                out[4..6].copy_from_slice(&port.to_le_bytes());
                6
            }
            Address::Ipv6 { ip, port } => {
                for (i, group) in ip.iter().enumerate() {
                    out[i * 2..i * 2 + 2].copy_from_slice(&group.to_le_bytes());
                }
                out[16..18].copy_from_slice(&port.to_le_bytes());
                18
            }
        }
    }

    /// Copy with the host portion and port blanked, for logs that
    /// must not carry full client endpoints.
    #[must_use]
    pub fn anonymized(&self) -> Address {
        match *self {
            Address::None => Address::None,
            Address::Ipv4 { ip, .. } => Address::Ipv4 {
                ip: [ip[0], ip[1], ip[2], 0],
                port: 0,
            },
            Address::Ipv6 { ip, .. } => Address::Ipv6 {
                ip: [ip[0], ip[1], ip[2], ip[3], 0, 0, 0, 0],
                port: 0,
            },
        }
    }

    /// Convert to a sendable socket address. None has no socket form.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::None => None,
            Address::Ipv4 { ip, port } => Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
                *port,
            ))),
            Address::Ipv6 { ip, port } => {
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*ip)), *port))
            }
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::Ipv4 {
                ip: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Address::Ipv6 {
                ip: v6.ip().segments(),
                port: v6.port(),
            },
        }
    }
}

impl FromStr for Address {
    type Err = ProxyError;

    /// Parse `[v6]:port`, bare IPv6, or IPv4 with optional `:port`.
    ///
    /// IPv6 is tried first: a leading `[` always means a bracketed
    /// address, and any string that parses as a numeric IPv6 address is
    /// one. Everything else is IPv4 with the port split off the tail.
    fn from_str(s: &str) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidAddress(s.to_string());

        if let Some(rest) = s.strip_prefix('[') {
            let close = rest.rfind(']').ok_or_else(invalid)?;
            let inner = &rest[..close];
            let tail = &rest[close + 1..];
            let port = if tail.is_empty() {
                0
            } else {
                tail.strip_prefix(':')
                    .and_then(|p| p.parse::<u16>().ok())
                    .ok_or_else(invalid)?
            };
            let ip = Ipv6Addr::from_str(inner).map_err(|_| invalid())?;
            return Ok(Address::Ipv6 {
                ip: ip.segments(),
                port,
            });
        }

        if let Ok(ip) = Ipv6Addr::from_str(s) {
            return Ok(Address::Ipv6 {
                ip: ip.segments(),
                port: 0,
            });
        }

        let (host, port) = match s.rfind(':') {
            Some(i) => {
                let port = s[i + 1..].parse::<u16>().map_err(|_| invalid())?;
                (&s[..i], port)
            }
            None => (s, 0),
        };

        let ip = Ipv4Addr::from_str(host).map_err(|_| invalid())?;
        Ok(Address::Ipv4 {
            ip: ip.octets(),
            port,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::None => f.write_str("NONE"),
            Address::Ipv4 { ip, port } => {
                if *port != 0 {
                    write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
                } else {
                    write!(f, "{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3])
                }
            }
            Address::Ipv6 { ip, port } => {
                let v6 = Ipv6Addr::from(*ip);
                if *port != 0 {
                    write!(f, "[{}]:{}", v6, port)
                } else {
                    write!(f, "{}", v6)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ipv4_with_port() {
        let a: Address = "127.0.0.1:40000".parse().unwrap();
        assert_eq!(a, Address::ipv4([127, 0, 0, 1], 40000));
    }

    #[test]
    fn parse_ipv4_without_port() {
        let a: Address = "10.2.3.4".parse().unwrap();
        assert_eq!(a, Address::ipv4([10, 2, 3, 4], 0));
    }

    #[test]
    fn parse_bracketed_ipv6() {
        let a: Address = "[::1]:9000".parse().unwrap();
        match a {
            Address::Ipv6 { ip, port } => {
                assert_eq!(ip, [0, 0, 0, 0, 0, 0, 0, 1]);
                assert_eq!(port, 9000);
            }
            _ => panic!("expected ipv6"),
        }
    }

    #[test]
    fn parse_bare_ipv6() {
        let a: Address = "fe80::1".parse().unwrap();
        assert!(matches!(a, Address::Ipv6 { port: 0, .. }));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("not an address".parse::<Address>().is_err());
        assert!("300.1.2.3:80".parse::<Address>().is_err());
        assert!("1.2.3.4:99999".parse::<Address>().is_err());
        assert!("[::1:80".parse::<Address>().is_err());
    }

    #[test]
    fn format_parse_round_trip() {
        let cases = [
            "1.2.3.4:5000",
            "255.255.255.255:65535",
            "10.0.0.1",
            "[::1]:9000",
            "[fe80::1234]:1",
        ];
        for s in cases {
            let a: Address = s.parse().unwrap();
            let b: Address = a.to_string().parse().unwrap();
            assert_eq!(a, b, "{}", s);
        }
    }

    #[test]
    fn format_none() {
        assert_eq!(Address::None.to_string(), "NONE");
    }

    #[test]
    fn equality_is_structural() {
        let a = Address::ipv4([1, 2, 3, 4], 80);
        let b = Address::ipv4([1, 2, 3, 4], 80);
        let c = Address::ipv4([1, 2, 3, 4], 81);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, Address::None);

        // different tags never compare equal, even with matching bytes
        let v6: Address = "[::1.2.3.4]:80".parse().unwrap();
        assert_ne!(a, v6);
    }

    #[test]
    fn socket_addr_round_trip() {
        let a = Address::ipv4([127, 0, 0, 1], 55000);
        let sa = a.to_socket_addr().unwrap();
        assert_eq!(Address::from(sa), a);
        assert!(Address::None.to_socket_addr().is_none());
    }

    #[test]
    fn anonymize_blanks_host_and_port() {
        let a = Address::ipv4([10, 20, 30, 40], 5000);
        assert_eq!(a.anonymized(), Address::ipv4([10, 20, 30, 0], 0));

        let v6: Address = "[fe80::1234]:80".parse().unwrap();
        match v6.anonymized() {
            Address::Ipv6 { ip, port } => {
                assert_eq!(port, 0);
                assert_eq!(&ip[4..], &[0, 0, 0, 0]);
            }
            _ => panic!("expected ipv6"),
        }
        assert_eq!(Address::None.anonymized(), Address::None);
    }

    #[test]
    fn address_data_ipv4_layout() {
        let a = Address::ipv4([1, 2, 3, 4], 0x1234);
        let mut buf = [0u8; MAX_ADDRESS_DATA_BYTES];
        let n = a.address_data(&mut buf);
        assert_eq!(n, 6);
        assert_eq!(&buf[..6], &[1, 2, 3, 4, 0x34, 0x12]);
    }
}
