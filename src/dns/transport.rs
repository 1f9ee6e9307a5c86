//! DNS transports: plain UDP, plain TCP and the system resolver

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, trace};

use super::{sort_addresses, DnsTransport, DomainStrategy};
use crate::error::{Error, Result};

const DEFAULT_DNS_PORT: u16 = 53;

/// Receive buffer for UDP responses (EDNS-sized)
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// TTL put on answers synthesized from the system resolver
const LOCAL_ANSWER_TTL: u32 = 60;

/// Build a transport from a server address.
///
/// Accepted forms: `local`, `udp://host[:port]`, `tcp://host[:port]`, or a
/// bare `host[:port]` (UDP).
pub fn new_transport(tag: &str, address: &str) -> Result<Arc<dyn DnsTransport>> {
    if address == "local" {
        return Ok(Arc::new(LocalTransport::new(tag)));
    }

    if let Some(rest) = address.strip_prefix("tcp://") {
        return Ok(Arc::new(TcpTransport::new(tag, parse_server(rest)?)));
    }

    let rest = address.strip_prefix("udp://").unwrap_or(address);
    if rest.contains("://") {
        return Err(Error::Config(format!(
            "unsupported dns server address: {}",
            address
        )));
    }
    Ok(Arc::new(UdpTransport::new(tag, parse_server(rest)?)))
}

fn parse_server(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let host = s.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DEFAULT_DNS_PORT))
        .map_err(|_| Error::Config(format!("invalid dns server address: {}", s)))
}

/// Plain DNS over UDP; one socket per exchange
pub struct UdpTransport {
    tag: String,
    server: SocketAddr,
}

impl UdpTransport {
    pub fn new(tag: impl Into<String>, server: SocketAddr) -> Self {
        Self {
            tag: tag.into(),
            server,
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }
}

#[async_trait]
impl DnsTransport for UdpTransport {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn exchange(&self, message: &Message) -> Result<Message> {
        let query = message.to_vec()?;

        let bind: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.send_to(&query, self.server).await?;
        trace!("[{}] sent {} byte query to {}", self.tag, query.len(), self.server);

        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if from != self.server {
                debug!("[{}] dropped response from unexpected source {}", self.tag, from);
                continue;
            }
            let response = Message::from_vec(&buf[..n])?;
            if response.id() != message.id() {
                debug!("[{}] dropped response with mismatched id {}", self.tag, response.id());
                continue;
            }
            return Ok(response);
        }
    }
}

/// Plain DNS over TCP with 2-byte length framing
pub struct TcpTransport {
    tag: String,
    server: SocketAddr,
}

impl TcpTransport {
    pub fn new(tag: impl Into<String>, server: SocketAddr) -> Self {
        Self {
            tag: tag.into(),
            server,
        }
    }
}

#[async_trait]
impl DnsTransport for TcpTransport {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn exchange(&self, message: &Message) -> Result<Message> {
        let query = message.to_vec()?;
        let len = u16::try_from(query.len())
            .map_err(|_| Error::Dns(format!("query too large: {} bytes", query.len())))?;

        let mut stream = TcpStream::connect(self.server).await?;
        let mut frame = Vec::with_capacity(query.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&query);
        stream.write_all(&frame).await?;

        let len = stream.read_u16().await? as usize;
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;

        let response = Message::from_vec(&buf)?;
        if response.id() != message.id() {
            return Err(Error::Dns(format!(
                "response id {} does not match query id {}",
                response.id(),
                message.id()
            )));
        }
        Ok(response)
    }
}

/// The operating system resolver
pub struct LocalTransport {
    tag: String,
}

impl LocalTransport {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let domain = domain.trim_end_matches('.');
        let addrs = tokio::net::lookup_host((domain, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

#[async_trait]
impl DnsTransport for LocalTransport {
    fn tag(&self) -> &str {
        &self.tag
    }

    /// Answers A and AAAA questions from the system resolver; other
    /// question types get an empty NOERROR response.
    async fn exchange(&self, message: &Message) -> Result<Message> {
        let mut response = Message::new();
        response
            .set_id(message.id())
            .set_message_type(MessageType::Response)
            .set_op_code(message.op_code())
            .set_recursion_desired(message.recursion_desired())
            .set_recursion_available(true)
            .set_response_code(ResponseCode::NoError);

        for query in message.queries() {
            response.add_query(query.clone());

            let wanted = query.query_type();
            if wanted != RecordType::A && wanted != RecordType::AAAA {
                continue;
            }

            let addrs = self.resolve(&query.name().to_string()).await?;
            for ip in addrs {
                let rdata = match (wanted, ip) {
                    (RecordType::A, IpAddr::V4(v4)) => RData::A(A(v4)),
                    (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA(v6)),
                    _ => continue,
                };
                response.add_answer(Record::from_rdata(query.name().clone(), LOCAL_ANSWER_TTL, rdata));
            }
        }

        Ok(response)
    }

    async fn lookup(&self, domain: &str, strategy: DomainStrategy) -> Result<Vec<IpAddr>> {
        let addrs = sort_addresses(self.resolve(domain).await?, strategy);
        if addrs.is_empty() {
            return Err(Error::Dns(format!("no addresses found for {}", domain)));
        }
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::build_query;

    #[test]
    fn test_new_transport_forms() {
        assert_eq!(new_transport("a", "local").unwrap().tag(), "a");
        assert!(new_transport("b", "udp://1.1.1.1").is_ok());
        assert!(new_transport("c", "tcp://[2606:4700::1111]:53").is_ok());
        assert!(new_transport("d", "8.8.8.8:5353").is_ok());
        assert!(new_transport("e", "https://dns.example/dns-query").is_err());
        assert!(new_transport("f", "udp://not-an-ip").is_err());
    }

    #[test]
    fn test_parse_server_default_port() {
        assert_eq!(parse_server("1.1.1.1").unwrap(), "1.1.1.1:53".parse().unwrap());
        assert_eq!(parse_server("[::1]").unwrap(), "[::1]:53".parse().unwrap());
    }

    #[tokio::test]
    async fn test_udp_exchange_against_loopback_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..n]).unwrap();

            let mut response = Message::new();
            response.set_id(query.id()).set_message_type(MessageType::Response);
            let q = query.queries()[0].clone();
            response.add_answer(Record::from_rdata(
                q.name().clone(),
                60,
                RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
            ));
            response.add_query(q);
            server.send_to(&response.to_vec().unwrap(), peer).await.unwrap();
        });

        let transport = UdpTransport::new("udp", server_addr);
        let query = build_query("example.com", RecordType::A).unwrap();
        let response = transport.exchange(&query).await.unwrap();
        assert_eq!(response.id(), query.id());
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_tcp_exchange_against_loopback_server() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let len = stream.read_u16().await.unwrap() as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf).unwrap();

            let mut response = Message::new();
            response.set_id(query.id()).set_message_type(MessageType::Response);
            let bytes = response.to_vec().unwrap();
            stream.write_u16(bytes.len() as u16).await.unwrap();
            stream.write_all(&bytes).await.unwrap();
        });

        let transport = TcpTransport::new("tcp", server_addr);
        let query = build_query("example.com", RecordType::A).unwrap();
        let response = transport.exchange(&query).await.unwrap();
        assert_eq!(response.id(), query.id());
    }

    #[tokio::test]
    async fn test_local_lookup_resolves_localhost() {
        let transport = LocalTransport::new("local");
        let addrs = transport
            .lookup("localhost", DomainStrategy::AsIs)
            .await
            .unwrap();
        assert!(addrs.iter().all(|ip| ip.is_loopback()));
    }
}
