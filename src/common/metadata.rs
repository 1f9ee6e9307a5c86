//! Metadata - the per-flow context the router decides on

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Address;
use crate::dns::DomainStrategy;
use crate::error::Error;

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            _ => Err(Error::Config(format!("unknown network: {}", s))),
        }
    }
}

/// Per-flow metadata.
///
/// Built by the inbound adapter when a connection is accepted or a datagram
/// is read. Rules only read it; the router may rewrite `domain_strategy`
/// before handing the flow to an outbound.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Tag of the inbound that produced this flow
    pub inbound_tag: String,
    /// Protocol of the inbound (direct, socks, http)
    pub inbound_type: &'static str,
    /// Network of the flow, fixed by the producing socket
    pub network: Network,
    /// Peer address of the inbound socket
    pub source: SocketAddr,
    /// Where the client wants to go
    pub destination: Address,
    /// Resolution strategy override selected by a rule
    pub domain_strategy: Option<DomainStrategy>,
}

impl Metadata {
    pub fn new(inbound_tag: impl Into<String>, network: Network, source: SocketAddr) -> Self {
        Self {
            inbound_tag: inbound_tag.into(),
            inbound_type: "",
            network,
            source,
            destination: Address::unspecified(),
            domain_strategy: None,
        }
    }

    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = destination;
        self
    }

    pub fn with_inbound_type(mut self, inbound_type: &'static str) -> Self {
        self.inbound_type = inbound_type;
        self
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new(
            String::new(),
            Network::Tcp,
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        )
    }
}
