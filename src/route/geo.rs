//! GeoIP / Geosite readers over V2Ray `.dat` databases
//!
//! Both are loaded once at router build time and handed to rules as shared
//! read-only handles.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use geosite_rs::{decode_geoip, decode_geosite, Cidr, Domain};
use ipnet::IpNet;
use tracing::debug;

use super::matcher::{normalize_domain, DomainMatcher};
use crate::error::{Error, Result};

fn cidr_to_net(cidr: &Cidr) -> Option<IpNet> {
    let ip = match cidr.ip.len() {
        4 => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&cidr.ip);
            IpAddr::V4(Ipv4Addr::from(bytes))
        }
        16 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&cidr.ip);
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };
    IpNet::new(ip, cidr.prefix as u8).ok()
}

/// Country code → networks
#[derive(Debug, Default)]
pub struct GeoIpReader {
    countries: HashMap<String, Vec<IpNet>>,
}

impl GeoIpReader {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|e| Error::Config(format!("read geoip database {:?}: {}", path, e)))?;
        let list = decode_geoip(&data)
            .map_err(|e| Error::Config(format!("parse geoip database {:?}: {}", path, e)))?;

        let mut reader = Self::default();
        for entry in &list.entry {
            let nets: Vec<IpNet> = entry.cidr.iter().filter_map(cidr_to_net).collect();
            reader.insert(&entry.country_code, nets);
        }

        debug!("[geoip] loaded {} countries from {:?}", reader.countries.len(), path);
        Ok(reader)
    }

    pub fn insert(&mut self, country_code: &str, nets: Vec<IpNet>) {
        self.countries.insert(country_code.to_lowercase(), nets);
    }

    pub fn contains_code(&self, country_code: &str) -> bool {
        self.countries.contains_key(&country_code.to_lowercase())
    }

    /// Whether `ip` belongs to `country_code` (case-insensitive)
    pub fn matches(&self, country_code: &str, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.countries
            .get(&country_code.to_lowercase())
            .is_some_and(|nets| nets.iter().any(|net| net.contains(&ip)))
    }

    /// First country containing `ip`
    pub fn lookup(&self, ip: IpAddr) -> Option<&str> {
        let ip = ip.to_canonical();
        self.countries
            .iter()
            .find(|(_, nets)| nets.iter().any(|net| net.contains(&ip)))
            .map(|(code, _)| code.as_str())
    }

    pub fn len(&self) -> usize {
        self.countries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }
}

fn domain_to_matcher(domain: &Domain) -> Option<DomainMatcher> {
    // geosite-rs type codes: 0 plain, 1 domain suffix, 2 full, 3 regex
    let value = domain.value.to_lowercase();
    match domain.r#type {
        0 => Some(DomainMatcher::Keyword(value)),
        1 => Some(DomainMatcher::Suffix(value)),
        2 => Some(DomainMatcher::Full(value)),
        3 => DomainMatcher::regex(&domain.value).ok(),
        _ => None,
    }
}

/// Category name → domain matchers
#[derive(Debug, Default)]
pub struct GeositeReader {
    sites: HashMap<String, Vec<DomainMatcher>>,
}

impl GeositeReader {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|e| Error::Config(format!("read geosite database {:?}: {}", path, e)))?;
        let list = decode_geosite(&data)
            .map_err(|e| Error::Config(format!("parse geosite database {:?}: {}", path, e)))?;

        let mut reader = Self::default();
        for site in &list.entry {
            let matchers: Vec<DomainMatcher> = site.domain.iter().filter_map(domain_to_matcher).collect();
            reader.insert(&site.country_code, matchers);
        }

        debug!("[geosite] loaded {} sites from {:?}", reader.sites.len(), path);
        Ok(reader)
    }

    pub fn insert(&mut self, code: &str, matchers: Vec<DomainMatcher>) {
        self.sites.insert(code.to_lowercase(), matchers);
    }

    pub fn contains_code(&self, code: &str) -> bool {
        self.sites.contains_key(&code.to_lowercase())
    }

    pub fn matches(&self, code: &str, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        self.sites
            .get(&code.to_lowercase())
            .is_some_and(|matchers| matchers.iter().any(|m| m.matches(&domain)))
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geoip_matches() {
        let mut reader = GeoIpReader::default();
        reader.insert("CN", vec!["223.5.5.0/24".parse().unwrap()]);

        assert!(reader.contains_code("cn"));
        assert!(reader.matches("cn", "223.5.5.5".parse().unwrap()));
        assert!(reader.matches("CN", "::ffff:223.5.5.5".parse().unwrap()));
        assert!(!reader.matches("cn", "1.1.1.1".parse().unwrap()));
        assert_eq!(reader.lookup("223.5.5.5".parse().unwrap()), Some("cn"));
    }

    #[test]
    fn test_geosite_matches() {
        let mut reader = GeositeReader::default();
        reader.insert(
            "google",
            vec![
                DomainMatcher::Suffix("google.com".into()),
                DomainMatcher::Full("youtu.be".into()),
            ],
        );

        assert!(reader.matches("GOOGLE", "Mail.Google.com."));
        assert!(reader.matches("google", "youtu.be"));
        assert!(!reader.matches("google", "example.com"));
        assert!(!reader.matches("cn", "baidu.com"));
    }

    #[test]
    fn test_missing_database_is_config_error() {
        let err = GeoIpReader::load("/nonexistent/geoip.dat").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
