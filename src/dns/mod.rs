//! DNS resolution subsystem
//!
//! Transports perform raw message exchanges; address lookups are built on top
//! of `exchange` unless a transport has a better way (the system resolver).
//! The router owns transport selection and the timeout, see `route::Router`.

mod format;
mod transport;

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use format::{format_answer, format_question, format_record_type, log_dns_answers, render_dns_answers};
pub use transport::{new_transport, LocalTransport, TcpTransport, UdpTransport};

/// Upper bound on any single exchange or lookup
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// Address family policy for lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStrategy {
    /// Both families, in the order the server returned them
    #[default]
    AsIs,
    PreferIpv4,
    PreferIpv6,
    Ipv4Only,
    Ipv6Only,
}

impl DomainStrategy {
    /// Record types to ask for under this strategy
    pub fn query_types(&self) -> &'static [RecordType] {
        match self {
            DomainStrategy::Ipv4Only => &[RecordType::A],
            DomainStrategy::Ipv6Only => &[RecordType::AAAA],
            _ => &[RecordType::A, RecordType::AAAA],
        }
    }
}

impl std::fmt::Display for DomainStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DomainStrategy::AsIs => "as_is",
            DomainStrategy::PreferIpv4 => "prefer_ipv4",
            DomainStrategy::PreferIpv6 => "prefer_ipv6",
            DomainStrategy::Ipv4Only => "ipv4_only",
            DomainStrategy::Ipv6Only => "ipv6_only",
        };
        f.write_str(name)
    }
}

impl FromStr for DomainStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "as_is" => Ok(DomainStrategy::AsIs),
            "prefer_ipv4" => Ok(DomainStrategy::PreferIpv4),
            "prefer_ipv6" => Ok(DomainStrategy::PreferIpv6),
            "ipv4_only" => Ok(DomainStrategy::Ipv4Only),
            "ipv6_only" => Ok(DomainStrategy::Ipv6Only),
            _ => Err(Error::Config(format!("unknown domain strategy: {}", s))),
        }
    }
}

/// A configured DNS upstream addressable by tag
#[async_trait]
pub trait DnsTransport: Send + Sync {
    fn tag(&self) -> &str;

    /// Send a full DNS message and return the server's response
    async fn exchange(&self, message: &Message) -> Result<Message>;

    /// Resolve `domain` to addresses under `strategy`
    async fn lookup(&self, domain: &str, strategy: DomainStrategy) -> Result<Vec<IpAddr>> {
        let queries = strategy
            .query_types()
            .iter()
            .map(|rt| build_query(domain, *rt))
            .collect::<Result<Vec<_>>>()?;

        let responses = join_all(queries.iter().map(|q| self.exchange(q))).await;

        let mut addrs = Vec::new();
        let mut first_error = None;
        for response in responses {
            match response {
                Ok(message) => addrs.extend(answer_addresses(&message)),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if addrs.is_empty() {
            return Err(first_error
                .unwrap_or_else(|| Error::Dns(format!("no addresses found for {}", domain))));
        }
        Ok(sort_addresses(addrs, strategy))
    }
}

/// Build a recursive query for `domain` with a random id
pub fn build_query(domain: &str, record_type: RecordType) -> Result<Message> {
    let mut name = Name::from_str(domain)?;
    name.set_fqdn(true);

    let mut message = Message::new();
    message
        .set_id(rand::random())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    Ok(message)
}

/// A and AAAA addresses in answer order
pub fn answer_addresses(message: &Message) -> Vec<IpAddr> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// Filter and order addresses by strategy; the sort is stable within a family
pub fn sort_addresses(mut addrs: Vec<IpAddr>, strategy: DomainStrategy) -> Vec<IpAddr> {
    match strategy {
        DomainStrategy::AsIs => {}
        DomainStrategy::PreferIpv4 => addrs.sort_by_key(|ip| !ip.is_ipv4()),
        DomainStrategy::PreferIpv6 => addrs.sort_by_key(|ip| !ip.is_ipv6()),
        DomainStrategy::Ipv4Only => addrs.retain(|ip| ip.is_ipv4()),
        DomainStrategy::Ipv6Only => addrs.retain(|ip| ip.is_ipv6()),
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, AAAA};
    use hickory_proto::rr::Record;
    use std::net::{Ipv4Addr, Ipv6Addr};

    struct StaticTransport {
        v4: Vec<Ipv4Addr>,
        v6: Vec<Ipv6Addr>,
    }

    #[async_trait]
    impl DnsTransport for StaticTransport {
        fn tag(&self) -> &str {
            "static"
        }

        async fn exchange(&self, message: &Message) -> Result<Message> {
            let query = message.queries()[0].clone();
            let mut response = Message::new();
            response.set_id(message.id());
            response.set_message_type(MessageType::Response);
            response.add_query(query.clone());
            match query.query_type() {
                RecordType::A => {
                    for ip in &self.v4 {
                        response.add_answer(Record::from_rdata(query.name().clone(), 60, RData::A(A(*ip))));
                    }
                }
                RecordType::AAAA => {
                    for ip in &self.v6 {
                        response.add_answer(Record::from_rdata(query.name().clone(), 60, RData::AAAA(AAAA(*ip))));
                    }
                }
                _ => {}
            }
            Ok(response)
        }
    }

    #[test]
    fn test_domain_strategy_serde_names() {
        let s: DomainStrategy = serde_json::from_str("\"prefer_ipv6\"").unwrap();
        assert_eq!(s, DomainStrategy::PreferIpv6);
        assert_eq!(serde_json::to_string(&DomainStrategy::Ipv4Only).unwrap(), "\"ipv4_only\"");
        assert_eq!("as_is".parse::<DomainStrategy>().unwrap(), DomainStrategy::AsIs);
        assert!("v4".parse::<DomainStrategy>().is_err());
    }

    #[test]
    fn test_sort_addresses() {
        let v4: IpAddr = "1.1.1.1".parse().unwrap();
        let v6: IpAddr = "2606:4700::1111".parse().unwrap();

        assert_eq!(sort_addresses(vec![v6, v4], DomainStrategy::PreferIpv4), vec![v4, v6]);
        assert_eq!(sort_addresses(vec![v4, v6], DomainStrategy::PreferIpv6), vec![v6, v4]);
        assert_eq!(sort_addresses(vec![v6, v4], DomainStrategy::AsIs), vec![v6, v4]);
        assert_eq!(sort_addresses(vec![v4, v6], DomainStrategy::Ipv6Only), vec![v6]);
    }

    #[test]
    fn test_build_query_is_fqdn() {
        let query = build_query("example.com", RecordType::AAAA).unwrap();
        assert!(query.recursion_desired());
        assert_eq!(query.queries()[0].name().to_string(), "example.com.");
        assert_eq!(query.queries()[0].query_type(), RecordType::AAAA);
    }

    #[tokio::test]
    async fn test_default_lookup_over_exchange() {
        let transport = StaticTransport {
            v4: vec![Ipv4Addr::new(93, 184, 216, 34)],
            v6: vec!["2606:2800:220:1::".parse().unwrap()],
        };

        let addrs = transport
            .lookup("example.com", DomainStrategy::PreferIpv6)
            .await
            .unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs[0].is_ipv6());

        let addrs = transport
            .lookup("example.com", DomainStrategy::Ipv4Only)
            .await
            .unwrap();
        assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);
    }

    #[tokio::test]
    async fn test_empty_lookup_is_error() {
        let transport = StaticTransport { v4: vec![], v6: vec![] };
        let err = transport
            .lookup("example.com", DomainStrategy::AsIs)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Dns(_)));
    }
}
