//! Destination address: either a resolved socket address or a domain name

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::{Error, Result};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// The unspecified IPv4 address with port 0
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Host part without the port
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }

    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(_, _) => None,
        }
    }

    pub fn as_domain(&self) -> Option<&str> {
        match self {
            Address::Domain(domain, _) => Some(domain),
            Address::Socket(_) => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.as_socket().map(|addr| addr.ip())
    }

    /// Replace the host with a resolved IP, keeping the port
    pub fn with_ip(&self, ip: IpAddr) -> Self {
        Address::Socket(SocketAddr::new(ip, self.port()))
    }

    /// Parse `host:port`, `ip:port` or `[ipv6]:port`
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("missing port in address: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in address: {}", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if host.is_empty() {
            return Err(Error::Config(format!("missing host in address: {}", s)));
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => Ok(Address::Socket(SocketAddr::new(ip, port))),
            Err(_) => Ok(Address::Domain(host.to_string(), port)),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            Address::parse("1.2.3.4:80").unwrap(),
            Address::Socket("1.2.3.4:80".parse().unwrap())
        );
        assert_eq!(
            Address::parse("example.com:443").unwrap(),
            Address::domain("example.com", 443)
        );
        assert_eq!(
            Address::parse("[::1]:53").unwrap(),
            Address::Socket("[::1]:53".parse().unwrap())
        );
        assert!(Address::parse("example.com").is_err());
        assert!(Address::parse(":80").is_err());
    }

    #[test]
    fn test_with_ip_keeps_port() {
        let addr = Address::domain("example.com", 8443);
        let resolved = addr.with_ip("93.184.216.34".parse().unwrap());
        assert_eq!(resolved.to_string(), "93.184.216.34:8443");
    }
}
