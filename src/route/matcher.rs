//! Domain, IP and port matchers shared by route rules, DNS rules and geosite

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;

use crate::error::{Error, Result};

/// A single domain condition.
///
/// Textual forms: `full:`, `domain:`, `keyword:`, `regexp:`; a bare value is a
/// suffix match.
#[derive(Debug, Clone)]
pub enum DomainMatcher {
    /// Exact match
    Full(String),
    /// The domain itself or any subdomain
    Suffix(String),
    /// Substring
    Keyword(String),
    Regex(Regex),
}

impl DomainMatcher {
    pub fn parse(pattern: &str) -> Result<Self> {
        if let Some(value) = pattern.strip_prefix("full:") {
            Ok(DomainMatcher::Full(value.to_lowercase()))
        } else if let Some(value) = pattern.strip_prefix("domain:") {
            Ok(DomainMatcher::Suffix(value.to_lowercase()))
        } else if let Some(value) = pattern.strip_prefix("keyword:") {
            Ok(DomainMatcher::Keyword(value.to_lowercase()))
        } else if let Some(value) = pattern.strip_prefix("regexp:") {
            Self::regex(value)
        } else {
            Ok(DomainMatcher::Suffix(pattern.to_lowercase()))
        }
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(DomainMatcher::Regex)
            .map_err(|e| Error::Config(format!("invalid domain regexp {}: {}", pattern, e)))
    }

    /// `domain` must already be lowercase without the root dot
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            DomainMatcher::Full(s) => domain == s,
            DomainMatcher::Suffix(s) => {
                domain == s
                    || (domain.len() > s.len()
                        && domain.ends_with(s.as_str())
                        && domain.as_bytes()[domain.len() - s.len() - 1] == b'.')
            }
            DomainMatcher::Keyword(s) => domain.contains(s.as_str()),
            DomainMatcher::Regex(re) => re.is_match(domain),
        }
    }
}

/// Lowercase and strip the root dot so matchers see one canonical form
pub fn normalize_domain(domain: &str) -> String {
    domain.trim_end_matches('.').to_lowercase()
}

/// Parse a CIDR or a bare address (as a host route)
pub fn parse_ip_net(s: &str) -> Result<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    s.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| Error::Config(format!("invalid ip cidr: {}", s)))
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

/// Parse a port list like `"80,443,1000-2000"`
pub fn parse_ports(pattern: &str) -> Result<Vec<PortRange>> {
    let invalid = || Error::Config(format!("invalid port pattern: {}", pattern));

    pattern
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('-') {
            Some((start, end)) => {
                let start = start.trim().parse::<u16>().map_err(|_| invalid())?;
                let end = end.trim().parse::<u16>().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                Ok(PortRange { start, end })
            }
            None => {
                let port = part.parse::<u16>().map_err(|_| invalid())?;
                Ok(PortRange { start: port, end: port })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_matchers() {
        let suffix = DomainMatcher::parse("domain:google.com").unwrap();
        assert!(suffix.matches("google.com"));
        assert!(suffix.matches("mail.google.com"));
        assert!(!suffix.matches("notgoogle.com"));

        let full = DomainMatcher::parse("full:example.com").unwrap();
        assert!(full.matches("example.com"));
        assert!(!full.matches("www.example.com"));

        let keyword = DomainMatcher::parse("keyword:facebook").unwrap();
        assert!(keyword.matches("facebookcdn.net"));

        let re = DomainMatcher::parse(r"regexp:^ads?\.").unwrap();
        assert!(re.matches("ad.example.com"));
        assert!(!re.matches("bad.example.com"));

        assert!(DomainMatcher::parse("regexp:(").is_err());
    }

    #[test]
    fn test_parse_ports() {
        let ports = parse_ports("80, 443,1000-2000").unwrap();
        assert_eq!(ports.len(), 3);
        assert!(ports.iter().any(|p| p.contains(1500)));
        assert!(!ports.iter().any(|p| p.contains(8080)));
        assert!(parse_ports("2000-1000").is_err());
        assert!(parse_ports("http").is_err());
    }

    #[test]
    fn test_parse_ip_net() {
        assert!(parse_ip_net("10.0.0.0/8").unwrap().contains(&"10.1.2.3".parse::<IpAddr>().unwrap()));
        let host = parse_ip_net("1.1.1.1").unwrap();
        assert_eq!(host.prefix_len(), 32);
        assert!(parse_ip_net("nope").is_err());
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("WWW.Example.COM."), "www.example.com");
    }
}
