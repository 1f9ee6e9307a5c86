//! Direct outbound - connects straight to the destination
//!
//! Domain destinations are resolved through the router so DNS rules and the
//! flow's domain strategy apply.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, Span};

use super::{Outbound, OutboundKind};
use crate::common::{Address, IntoStream, Metadata, PacketConn, SharedPacketConn, Stream};
use crate::config::OutboundOptions;
use crate::dns::DomainStrategy;
use crate::error::{Error, Result};
use crate::route::Router;

/// Dial timeout when the outbound sets none
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Resolve `domain` through the router with `strategy`, or the router's
/// default strategy when none is set
pub(crate) async fn resolve(
    router: &Weak<Router>,
    domain: &str,
    strategy: Option<DomainStrategy>,
) -> Result<Vec<IpAddr>> {
    let router = router.upgrade().ok_or(Error::Closed)?;
    match strategy {
        Some(strategy) => router.lookup(domain, strategy).await,
        None => router.lookup_default(domain).await,
    }
}

/// Connect to `destination`, trying each resolved address in order
pub(crate) async fn connect_tcp(
    router: &Weak<Router>,
    destination: &Address,
    strategy: Option<DomainStrategy>,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let addrs = match destination {
        Address::Socket(addr) => vec![*addr],
        Address::Domain(domain, port) => resolve(router, domain, strategy)
            .await?
            .into_iter()
            .map(|ip| SocketAddr::new(ip, *port))
            .collect(),
    };

    let mut last_error = None;
    for addr in addrs {
        match tokio::time::timeout(connect_timeout, connect_addr(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
            Err(_) => {
                debug!("connect to {} timed out", addr);
                last_error = Some(Error::Timeout);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::Dns(format!("no addresses for {}", destination))))
}

async fn connect_addr(addr: SocketAddr) -> Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    // Detect dead peers on long-lived connections
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME);
    SockRef::from(&socket).set_tcp_keepalive(&keepalive)?;

    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub struct DirectOutbound {
    tag: String,
    router: Weak<Router>,
    domain_strategy: Option<DomainStrategy>,
    override_address: Option<String>,
    override_port: Option<u16>,
    connect_timeout: Duration,
    span: Span,
}

impl DirectOutbound {
    pub fn new(tag: String, router: Weak<Router>, options: &OutboundOptions, span: Span) -> Self {
        Self {
            tag,
            router,
            domain_strategy: options.domain_strategy,
            override_address: options.override_address.clone(),
            override_port: options.override_port,
            connect_timeout: options
                .connect_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            span,
        }
    }

    /// Destination after applying the configured overrides
    fn destination(&self, metadata: &Metadata) -> Address {
        let port = self.override_port.unwrap_or_else(|| metadata.destination.port());
        match &self.override_address {
            Some(host) => match host.parse::<IpAddr>() {
                Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
                Err(_) => Address::Domain(host.clone(), port),
            },
            None => match &metadata.destination {
                Address::Socket(addr) => Address::Socket(SocketAddr::new(addr.ip(), port)),
                Address::Domain(domain, _) => Address::Domain(domain.clone(), port),
            },
        }
    }

    /// Rule override first, then this outbound's own setting
    fn strategy(&self, metadata: &Metadata) -> Option<DomainStrategy> {
        metadata.domain_strategy.or(self.domain_strategy)
    }
}

#[async_trait]
impl Outbound for DirectOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> OutboundKind {
        OutboundKind::Direct
    }

    fn span(&self) -> Span {
        self.span.clone()
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Stream> {
        let destination = self.destination(metadata);
        let stream = connect_tcp(
            &self.router,
            &destination,
            self.strategy(metadata),
            self.connect_timeout,
        )
        .await?;
        debug!("[{}] connected to {}", self.tag, destination);
        Ok(stream.into_stream())
    }

    async fn listen_packet(&self, metadata: &Metadata) -> Result<SharedPacketConn> {
        let conn = DirectPacketConn::bind(self.router.clone(), self.strategy(metadata))?;
        Ok(std::sync::Arc::new(conn))
    }
}

/// Unconnected UDP socket for direct datagram relay.
///
/// Bound dual-stack on `[::]:0` where the platform allows it, so one socket
/// reaches both address families.
pub struct DirectPacketConn {
    socket: UdpSocket,
    dual_stack: bool,
    router: Weak<Router>,
    strategy: Option<DomainStrategy>,
    closed: watch::Sender<bool>,
}

impl DirectPacketConn {
    pub fn bind(router: Weak<Router>, strategy: Option<DomainStrategy>) -> Result<Self> {
        let (socket, dual_stack) = match dual_stack_socket() {
            Ok(socket) => (socket, true),
            Err(e) => {
                debug!("dual-stack udp socket unavailable, using ipv4: {}", e);
                (std::net::UdpSocket::bind("0.0.0.0:0")?, false)
            }
        };
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            dual_stack,
            router,
            strategy,
            closed: watch::channel(false).0,
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

fn dual_stack_socket() -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0).into())?;
    Ok(socket.into())
}

#[async_trait]
impl PacketConn for DirectPacketConn {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, Address)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(Error::Closed);
        }

        tokio::select! {
            result = self.socket.recv_from(buf) => {
                let (n, from) = result?;
                Ok((n, Address::Socket(SocketAddr::new(from.ip().to_canonical(), from.port()))))
            }
            _ = closed.wait_for(|closed| *closed) => Err(Error::Closed),
        }
    }

    async fn write_packet(&self, payload: Bytes, destination: Address) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let target = match destination {
            Address::Socket(addr) => addr,
            Address::Domain(domain, port) => {
                let ip = resolve(&self.router, &domain, self.strategy)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::Dns(format!("no addresses for {}", domain)))?;
                SocketAddr::new(ip, port)
            }
        };

        let target = match target {
            SocketAddr::V4(v4) if self.dual_stack => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port())
            }
            SocketAddr::V6(v6) if !self.dual_stack => {
                return Err(Error::Unsupported(format!("ipv6 destination {} on ipv4 socket", v6)))
            }
            other => other,
        };

        self.socket.send_to(&payload, target).await?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}
