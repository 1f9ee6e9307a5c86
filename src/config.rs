//! Configuration module for flowgate
//!
//! JSON configuration: inbounds, outbounds, route rules and DNS servers.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::common::Network;
use crate::dns::DomainStrategy;
use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub inbounds: Vec<InboundOptions>,

    #[serde(default)]
    pub outbounds: Vec<OutboundOptions>,

    #[serde(default)]
    pub route: RouteConfig,

    #[serde(default)]
    pub experimental: ExperimentalConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Cross-reference checks that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let mut inbound_tags = HashSet::new();
        for inbound in &self.inbounds {
            if !inbound.tag.is_empty() && !inbound_tags.insert(inbound.tag.as_str()) {
                return Err(Error::Config(format!("duplicate inbound tag: {}", inbound.tag)));
            }
        }

        let mut outbound_tags = HashSet::new();
        for outbound in &self.outbounds {
            let tag = outbound.effective_tag();
            if !outbound_tags.insert(tag) {
                return Err(Error::Config(format!("duplicate outbound tag: {}", tag)));
            }
        }

        let referenced = self
            .route
            .rules
            .iter()
            .map(|r| r.outbound.as_str())
            .chain(self.route.final_outbound.as_deref());
        for tag in referenced {
            if !outbound_tags.contains(tag) {
                return Err(Error::Config(format!("route references unknown outbound: {}", tag)));
            }
        }

        let servers: HashSet<&str> = self.dns.servers.iter().map(|s| s.tag.as_str()).collect();
        let referenced = self
            .dns
            .rules
            .iter()
            .map(|r| r.server.as_str())
            .chain(self.dns.final_server.as_deref());
        for tag in referenced {
            if !servers.contains(tag) {
                return Err(Error::Config(format!("dns references unknown server: {}", tag)));
            }
        }

        Ok(())
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub disabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            disabled: false,
        }
    }
}

/// One listener
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundOptions {
    #[serde(rename = "type")]
    pub inbound_type: String,

    pub tag: String,

    /// Bind address; required
    pub listen: Option<IpAddr>,

    pub listen_port: u16,

    pub tcp_fast_open: bool,

    /// Restrict to one network; both when absent (where the protocol allows)
    pub network: Option<Network>,

    /// `direct` inbound: fixed destination host
    pub override_address: Option<String>,

    /// `direct` inbound: fixed destination port
    pub override_port: Option<u16>,

    /// `socks` / `http` credentials; no auth when empty
    pub users: Vec<UserOptions>,

    /// Initial resolution strategy for flows from this inbound
    pub domain_strategy: Option<DomainStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserOptions {
    pub username: String,
    pub password: String,
}

/// One outbound.
///
/// A flat option set shared by every type; fields a type does not use are
/// ignored. Options for externally provided protocols land in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundOptions {
    #[serde(rename = "type")]
    pub outbound_type: String,

    pub tag: String,

    pub server: String,

    pub server_port: u16,

    pub username: Option<String>,

    pub password: Option<String>,

    /// `direct`: rewrite the destination host
    pub override_address: Option<String>,

    /// `direct`: rewrite the destination port
    pub override_port: Option<u16>,

    pub domain_strategy: Option<DomainStrategy>,

    /// Dial timeout in seconds
    pub connect_timeout: Option<u64>,

    /// `selector` / `urltest` members
    pub outbounds: Vec<String>,

    /// `selector`: initially selected member
    pub default: Option<String>,

    /// `urltest`: probe URL
    pub url: Option<String>,

    /// `urltest`: probe interval in seconds
    pub interval: Option<u64>,

    /// `urltest`: keep the current member unless another is faster by this many ms
    pub tolerance: Option<u64>,

    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl OutboundOptions {
    /// Whether nothing at all was configured
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The configured tag, or the type name when none is set
    pub fn effective_tag(&self) -> &str {
        if self.tag.is_empty() {
            &self.outbound_type
        } else {
            &self.tag
        }
    }
}

/// Routing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub rules: Vec<RuleOptions>,

    /// Outbound for flows no rule matches; the first outbound when absent
    #[serde(rename = "final")]
    pub final_outbound: Option<String>,

    pub geoip: Option<PathBuf>,

    pub geosite: Option<PathBuf>,
}

/// Field rule: every non-empty condition must hold
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleOptions {
    pub inbound: Vec<String>,

    pub network: Vec<Network>,

    /// `full:`, `domain:`, `keyword:`, `regexp:`, `geosite:` or bare suffix
    pub domain: Vec<String>,

    /// CIDR, bare address or `geoip:<code>`
    pub ip_cidr: Vec<String>,

    pub source_ip_cidr: Vec<String>,

    /// e.g. `"80,443,8000-9000"`
    pub port: Option<String>,

    pub outbound: String,

    /// Resolution strategy override for matched flows
    pub domain_strategy: Option<DomainStrategy>,
}

/// DNS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub servers: Vec<DnsServerOptions>,

    pub rules: Vec<DnsRuleOptions>,

    /// Default server tag; the first server (or the system resolver) when absent
    #[serde(rename = "final")]
    pub final_server: Option<String>,

    /// Default lookup strategy; also used by outbounds that set none
    pub strategy: DomainStrategy,

    /// Exchange timeout in seconds
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsServerOptions {
    pub tag: String,

    /// `local`, `udp://host[:port]`, `tcp://host[:port]` or `host[:port]`
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsRuleOptions {
    pub inbound: Vec<String>,

    pub domain: Vec<String>,

    pub server: String,

    pub strategy: Option<DomainStrategy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentalConfig {
    /// Serve Prometheus metrics at `http://<addr>/metrics`
    pub metrics_listen: Option<SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "log": { "level": "debug" },
        "dns": {
            "servers": [
                { "tag": "cloudflare", "address": "udp://1.1.1.1" },
                { "tag": "system", "address": "local" }
            ],
            "rules": [ { "domain": ["domain:lan"], "server": "system" } ],
            "final": "cloudflare",
            "strategy": "prefer_ipv4"
        },
        "inbounds": [
            { "type": "socks", "tag": "socks-in", "listen": "127.0.0.1", "listen_port": 1080 },
            { "type": "direct", "tag": "dns-in", "listen": "::", "listen_port": 5353,
              "network": "udp", "override_address": "1.1.1.1", "override_port": 53 }
        ],
        "outbounds": [
            { "type": "direct", "tag": "direct" },
            { "type": "block", "tag": "block" },
            { "type": "shadowsocks", "tag": "ss", "server": "1.2.3.4", "server_port": 8388,
              "method": "aes-128-gcm", "password": "secret" }
        ],
        "route": {
            "rules": [ { "domain": ["keyword:ads"], "outbound": "block" } ],
            "final": "direct"
        },
        "experimental": { "metrics_listen": "127.0.0.1:9090" }
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.dns.strategy, DomainStrategy::PreferIpv4);
        assert_eq!(config.inbounds.len(), 2);
        assert_eq!(config.inbounds[1].network, Some(Network::Udp));
        assert_eq!(config.outbounds[2].extra["method"], "aes-128-gcm");
        assert_eq!(config.outbounds[2].password.as_deref(), Some("secret"));
        assert_eq!(config.route.final_outbound.as_deref(), Some("direct"));
        assert!(config.experimental.metrics_listen.is_some());
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_outbound_detection() {
        assert!(OutboundOptions::default().is_empty());
        let opts: OutboundOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.is_empty());
        let opts: OutboundOptions = serde_json::from_str(r#"{"tag":"x"}"#).unwrap();
        assert!(!opts.is_empty());
    }

    #[test]
    fn test_validate_unknown_references() {
        let mut config = Config::from_json(SAMPLE).unwrap();
        config.route.rules[0].outbound = "missing".into();
        assert!(config.validate().is_err());

        let mut config = Config::from_json(SAMPLE).unwrap();
        config.dns.final_server = Some("missing".into());
        assert!(config.validate().is_err());

        let mut config = Config::from_json(SAMPLE).unwrap();
        config.outbounds[1].tag = "direct".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.log.level, "info");
        assert!(config.inbounds.is_empty());
        assert_eq!(config.dns.strategy, DomainStrategy::AsIs);
        assert!(config.dns.timeout.is_none());
    }
}
