//! Route rules and DNS rules

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use super::geo::{GeoIpReader, GeositeReader};
use super::matcher::{normalize_domain, parse_ip_net, parse_ports, DomainMatcher, PortRange};
use crate::common::{Address, Metadata, Network};
use crate::config::{DnsRuleOptions, RuleOptions};
use crate::dns::DomainStrategy;
use crate::error::{Error, Result};

/// A routing rule: a predicate over metadata plus a target outbound tag
pub trait Rule: fmt::Display + Send + Sync {
    /// Acquire whatever the predicate needs; called once before traffic flows
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn matches(&self, metadata: &Metadata) -> bool;

    /// Target outbound tag
    fn outbound(&self) -> &str;

    /// Resolution strategy forced onto matched flows
    fn domain_strategy(&self) -> Option<DomainStrategy> {
        None
    }
}

/// Domain conditions split into plain matchers and geosite categories
#[derive(Debug, Default)]
struct DomainSet {
    matchers: Vec<DomainMatcher>,
    geosite: Vec<String>,
}

impl DomainSet {
    fn parse(patterns: &[String]) -> Result<Self> {
        let mut set = Self::default();
        for pattern in patterns {
            match pattern.strip_prefix("geosite:") {
                Some(code) => set.geosite.push(code.to_lowercase()),
                None => set.matchers.push(DomainMatcher::parse(pattern)?),
            }
        }
        Ok(set)
    }

    fn is_empty(&self) -> bool {
        self.matchers.is_empty() && self.geosite.is_empty()
    }

    fn matches(&self, domain: &str, reader: Option<&GeositeReader>) -> bool {
        let domain = normalize_domain(domain);
        if self.matchers.iter().any(|m| m.matches(&domain)) {
            return true;
        }
        match reader {
            Some(reader) => self.geosite.iter().any(|code| reader.matches(code, &domain)),
            None => false,
        }
    }

    fn check_geosite(&self, reader: Option<&GeositeReader>) -> Result<()> {
        for code in &self.geosite {
            match reader {
                None => {
                    return Err(Error::Config(format!(
                        "geosite:{} used but no geosite database is loaded",
                        code
                    )))
                }
                Some(reader) if !reader.contains_code(code) => {
                    return Err(Error::Config(format!("geosite:{} not found in database", code)))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Field rule built from `RuleOptions`; every configured condition must hold
pub struct DefaultRule {
    inbound: Vec<String>,
    network: Vec<Network>,
    domain: DomainSet,
    ip_cidr: Vec<IpNet>,
    geoip: Vec<String>,
    source_ip_cidr: Vec<IpNet>,
    port: Vec<PortRange>,
    outbound: String,
    domain_strategy: Option<DomainStrategy>,
    geoip_reader: Option<Arc<GeoIpReader>>,
    geosite_reader: Option<Arc<GeositeReader>>,
    label: String,
}

impl DefaultRule {
    pub fn new(
        options: &RuleOptions,
        geoip_reader: Option<Arc<GeoIpReader>>,
        geosite_reader: Option<Arc<GeositeReader>>,
    ) -> Result<Self> {
        if options.outbound.is_empty() {
            return Err(Error::Config("rule is missing an outbound".into()));
        }

        let mut ip_cidr = Vec::new();
        let mut geoip = Vec::new();
        for pattern in &options.ip_cidr {
            match pattern.strip_prefix("geoip:") {
                Some(code) => geoip.push(code.to_lowercase()),
                None => ip_cidr.push(parse_ip_net(pattern)?),
            }
        }

        let source_ip_cidr = options
            .source_ip_cidr
            .iter()
            .map(|s| parse_ip_net(s))
            .collect::<Result<Vec<_>>>()?;

        let port = match &options.port {
            Some(pattern) => parse_ports(pattern)?,
            None => Vec::new(),
        };

        Ok(Self {
            inbound: options.inbound.clone(),
            network: options.network.clone(),
            domain: DomainSet::parse(&options.domain)?,
            ip_cidr,
            geoip,
            source_ip_cidr,
            port,
            outbound: options.outbound.clone(),
            domain_strategy: options.domain_strategy,
            geoip_reader,
            geosite_reader,
            label: rule_label(options),
        })
    }

    fn match_ip(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        if self.ip_cidr.iter().any(|net| net.contains(&ip)) {
            return true;
        }
        match &self.geoip_reader {
            Some(reader) => self.geoip.iter().any(|code| reader.matches(code, ip)),
            None => false,
        }
    }
}

fn rule_label(options: &RuleOptions) -> String {
    let mut parts = Vec::new();
    if !options.inbound.is_empty() {
        parts.push(format!("inbound={}", options.inbound.join(",")));
    }
    if !options.network.is_empty() {
        let networks: Vec<String> = options.network.iter().map(|n| n.to_string()).collect();
        parts.push(format!("network={}", networks.join(",")));
    }
    if !options.domain.is_empty() {
        parts.push(format!("domain={}", options.domain.join(",")));
    }
    if !options.ip_cidr.is_empty() {
        parts.push(format!("ip_cidr={}", options.ip_cidr.join(",")));
    }
    if !options.source_ip_cidr.is_empty() {
        parts.push(format!("source_ip_cidr={}", options.source_ip_cidr.join(",")));
    }
    if let Some(port) = &options.port {
        parts.push(format!("port={}", port));
    }
    if parts.is_empty() {
        parts.push("any".to_string());
    }
    parts.join(" ")
}

impl fmt::Display for DefaultRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl Rule for DefaultRule {
    fn start(&self) -> Result<()> {
        self.domain.check_geosite(self.geosite_reader.as_deref())?;
        for code in &self.geoip {
            match &self.geoip_reader {
                None => {
                    return Err(Error::Config(format!(
                        "geoip:{} used but no geoip database is loaded",
                        code
                    )))
                }
                Some(reader) if !reader.contains_code(code) => {
                    return Err(Error::Config(format!("geoip:{} not found in database", code)))
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn matches(&self, metadata: &Metadata) -> bool {
        if !self.inbound.is_empty() && !self.inbound.iter().any(|t| *t == metadata.inbound_tag) {
            return false;
        }

        if !self.network.is_empty() && !self.network.contains(&metadata.network) {
            return false;
        }

        if !self.port.is_empty() {
            let port = metadata.destination.port();
            if !self.port.iter().any(|range| range.contains(port)) {
                return false;
            }
        }

        if !self.source_ip_cidr.is_empty() {
            let source = metadata.source.ip().to_canonical();
            if !self.source_ip_cidr.iter().any(|net| net.contains(&source)) {
                return false;
            }
        }

        let has_domain = !self.domain.is_empty();
        let has_ip = !self.ip_cidr.is_empty() || !self.geoip.is_empty();
        if !has_domain && !has_ip {
            return true;
        }

        match &metadata.destination {
            Address::Domain(domain, _) => {
                has_domain && self.domain.matches(domain, self.geosite_reader.as_deref())
            }
            Address::Socket(addr) => has_ip && self.match_ip(addr.ip()),
        }
    }

    fn outbound(&self) -> &str {
        &self.outbound
    }

    fn domain_strategy(&self) -> Option<DomainStrategy> {
        self.domain_strategy
    }
}

/// Picks a DNS server for a domain
pub struct DnsRule {
    inbound: Vec<String>,
    domain: DomainSet,
    server: String,
    strategy: Option<DomainStrategy>,
    geosite_reader: Option<Arc<GeositeReader>>,
}

impl DnsRule {
    pub fn new(options: &DnsRuleOptions, geosite_reader: Option<Arc<GeositeReader>>) -> Result<Self> {
        if options.server.is_empty() {
            return Err(Error::Config("dns rule is missing a server".into()));
        }
        Ok(Self {
            inbound: options.inbound.clone(),
            domain: DomainSet::parse(&options.domain)?,
            server: options.server.clone(),
            strategy: options.strategy,
            geosite_reader,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.domain.check_geosite(self.geosite_reader.as_deref())
    }

    /// Both conditions are optional; an inbound condition needs a known inbound
    pub fn matches(&self, domain: Option<&str>, inbound_tag: Option<&str>) -> bool {
        if !self.inbound.is_empty() {
            match inbound_tag {
                Some(tag) if self.inbound.iter().any(|t| t == tag) => {}
                _ => return false,
            }
        }

        if self.domain.is_empty() {
            return true;
        }
        match domain {
            Some(domain) => self.domain.matches(domain, self.geosite_reader.as_deref()),
            None => false,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn strategy(&self) -> Option<DomainStrategy> {
        self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn metadata(destination: Address) -> Metadata {
        Metadata::new("socks-in", Network::Tcp, "192.168.1.10:50000".parse().unwrap())
            .with_destination(destination)
    }

    fn rule(options: RuleOptions) -> DefaultRule {
        DefaultRule::new(&options, None, None).unwrap()
    }

    #[test]
    fn test_domain_rule() {
        let r = rule(RuleOptions {
            domain: vec!["domain:google.com".into()],
            outbound: "proxy".into(),
            ..Default::default()
        });

        assert!(r.matches(&metadata(Address::domain("www.google.com", 443))));
        assert!(!r.matches(&metadata(Address::domain("example.com", 443))));
        // Domain-only rules never match IP destinations
        assert!(!r.matches(&metadata(Address::Socket("8.8.8.8:443".parse().unwrap()))));
    }

    #[test]
    fn test_port_and_network_rule() {
        let r = rule(RuleOptions {
            network: vec![Network::Tcp],
            port: Some("443,8000-9000".into()),
            outbound: "proxy".into(),
            ..Default::default()
        });

        assert!(r.matches(&metadata(Address::domain("example.com", 443))));
        assert!(r.matches(&metadata(Address::domain("example.com", 8080))));
        assert!(!r.matches(&metadata(Address::domain("example.com", 80))));

        let mut udp = metadata(Address::domain("example.com", 443));
        udp.network = Network::Udp;
        assert!(!r.matches(&udp));
    }

    #[test]
    fn test_ip_and_source_rule() {
        let r = rule(RuleOptions {
            ip_cidr: vec!["10.0.0.0/8".into(), "1.1.1.1".into()],
            source_ip_cidr: vec!["192.168.0.0/16".into()],
            outbound: "lan".into(),
            ..Default::default()
        });

        let dest: SocketAddr = "10.2.3.4:22".parse().unwrap();
        assert!(r.matches(&metadata(Address::Socket(dest))));
        assert!(r.matches(&metadata(Address::Socket("[::ffff:1.1.1.1]:53".parse().unwrap()))));
        assert!(!r.matches(&metadata(Address::Socket("8.8.8.8:53".parse().unwrap()))));

        let mut other_source = metadata(Address::Socket(dest));
        other_source.source = "172.16.0.1:1000".parse().unwrap();
        assert!(!r.matches(&other_source));
    }

    #[test]
    fn test_geoip_rule_requires_database() {
        let options = RuleOptions {
            ip_cidr: vec!["geoip:cn".into()],
            outbound: "direct".into(),
            ..Default::default()
        };

        let without = DefaultRule::new(&options, None, None).unwrap();
        assert!(without.start().is_err());

        let mut reader = GeoIpReader::default();
        reader.insert("cn", vec!["223.5.5.0/24".parse().unwrap()]);
        let with = DefaultRule::new(&options, Some(Arc::new(reader)), None).unwrap();
        with.start().unwrap();
        assert!(with.matches(&metadata(Address::Socket("223.5.5.5:53".parse().unwrap()))));
    }

    #[test]
    fn test_geosite_rule() {
        let mut reader = GeositeReader::default();
        reader.insert("ads", vec![DomainMatcher::Keyword("adserver".into())]);
        let options = RuleOptions {
            domain: vec!["geosite:ads".into()],
            outbound: "block".into(),
            ..Default::default()
        };
        let r = DefaultRule::new(&options, None, Some(Arc::new(reader))).unwrap();
        r.start().unwrap();
        assert!(r.matches(&metadata(Address::domain("adserver.example.com", 443))));
    }

    #[test]
    fn test_rule_label() {
        let r = rule(RuleOptions {
            inbound: vec!["socks-in".into()],
            port: Some("53".into()),
            outbound: "dns".into(),
            ..Default::default()
        });
        assert_eq!(r.to_string(), "inbound=socks-in port=53");
        assert!(DefaultRule::new(&RuleOptions::default(), None, None).is_err());
    }

    #[test]
    fn test_dns_rule() {
        let r = DnsRule::new(
            &DnsRuleOptions {
                inbound: vec![],
                domain: vec!["domain:lan".into()],
                server: "system".into(),
                strategy: Some(DomainStrategy::Ipv4Only),
            },
            None,
        )
        .unwrap();

        assert!(r.matches(Some("nas.lan."), None));
        assert!(!r.matches(Some("example.com"), None));
        assert!(!r.matches(None, None));
        assert_eq!(r.server(), "system");
        assert_eq!(r.strategy(), Some(DomainStrategy::Ipv4Only));
    }
}
