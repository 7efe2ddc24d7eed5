//! Destination addresses requested by clients.

use hyper::http::uri::Authority;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Where a client asked to be connected.
///
/// Domain names are kept unresolved so resolution happens at dial time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Build a target from a host string and port.
    ///
    /// IP literals (bracketed or not) become [`TargetAddr::Ip`].
    pub fn from_host_port(host: &str, port: u16) -> Self {
        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        match bare.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(bare.to_string(), port),
        }
    }

    /// Build a target from a URI authority, using `default_port` when the
    /// authority carries none.
    pub fn from_authority(authority: &Authority, default_port: u16) -> Option<Self> {
        let host = authority.host();
        if host.is_empty() {
            return None;
        }
        let port = authority.port_u16().unwrap_or(default_port);
        Some(Self::from_host_port(host, port))
    }

    /// Parse a `host[:port]` string such as a Host header value.
    pub fn parse(value: &str, default_port: u16) -> Option<Self> {
        let authority: Authority = value.trim().parse().ok()?;
        Self::from_authority(&authority, default_port)
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain_with_port() {
        let target = TargetAddr::parse("www.example.com:8080", 80).unwrap();
        assert_eq!(target, TargetAddr::Domain("www.example.com".to_string(), 8080));
        assert_eq!(target.to_string(), "www.example.com:8080");
    }

    #[test]
    fn test_parse_applies_default_port() {
        let target = TargetAddr::parse("example.com", 443).unwrap();
        assert_eq!(target.port(), 443);
    }

    #[test]
    fn test_parse_ipv4_literal() {
        let target = TargetAddr::parse("127.0.0.1:9000", 80).unwrap();
        assert_eq!(target, TargetAddr::Ip("127.0.0.1:9000".parse().unwrap()));
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let target = TargetAddr::parse("[::1]:8443", 80).unwrap();
        assert_eq!(target, TargetAddr::Ip("[::1]:8443".parse().unwrap()));
        assert_eq!(target.to_string(), "[::1]:8443");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(TargetAddr::parse("", 80).is_none());
        assert!(TargetAddr::parse("bad host:80", 80).is_none());
    }
}
