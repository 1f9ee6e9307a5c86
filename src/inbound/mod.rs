//! Inbound adapters
//!
//! ```text
//! socket ──▶ InboundAdapter ──Metadata──▶ protocol handler ──▶ Router
//! ```
//!
//! `InboundAdapter` owns the listening sockets and their loops; protocol
//! handlers (direct, socks, http) only see accepted streams and datagrams.

mod adapter;
mod direct;
mod http;
mod nat;
mod socks;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::common::{Metadata, Network, SharedPacketConn, Stream};
use crate::config::InboundOptions;
use crate::error::{Error, Result};
use crate::protocol::Credentials;
use crate::route::Router;

pub use adapter::{InboundAdapter, InboundPacketConn, PendingPacket};
pub use direct::DirectInbound;
pub use http::HttpInbound;
pub use nat::{NatSession, NatTable};
pub use socks::SocksInbound;

/// Where an inbound binds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenOptions {
    pub listen: IpAddr,
    pub listen_port: u16,
    pub tcp_fast_open: bool,
}

impl ListenOptions {
    pub fn new(listen: IpAddr, listen_port: u16) -> Self {
        Self {
            listen,
            listen_port,
            tcp_fast_open: false,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen, self.listen_port)
    }
}

/// Receives every accepted TCP connection
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn new_connection(&self, stream: Stream, metadata: Metadata) -> Result<()>;
}

/// One received datagram.
///
/// `Borrowed` points into the adapter's read buffer and is only valid for the
/// duration of the `new_packet` call; `Owned` may be kept.
#[derive(Debug)]
pub enum PacketData<'a> {
    Borrowed(&'a [u8]),
    Owned(Bytes),
}

impl PacketData<'_> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            PacketData::Borrowed(data) => data,
            PacketData::Owned(data) => data,
        }
    }

    /// Take ownership, copying only when borrowed
    pub fn into_bytes(self) -> Bytes {
        match self {
            PacketData::Borrowed(data) => Bytes::copy_from_slice(data),
            PacketData::Owned(data) => data,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

/// Receives every datagram read from the inbound's UDP socket
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// `conn` writes replies back through the inbound socket
    async fn new_packet(
        &self,
        conn: SharedPacketConn,
        packet: PacketData<'_>,
        metadata: Metadata,
    ) -> Result<()>;

    /// When true the adapter reuses one read buffer and hands out
    /// `PacketData::Borrowed`, awaiting each call before the next read.
    /// Otherwise every datagram gets its own `PacketData::Owned` buffer.
    fn requires_exclusive_buffer(&self) -> bool {
        false
    }

    /// Called once the inbound's UDP loops have stopped; ends any flows the
    /// handler still tracks
    fn close(&self) {}
}

/// Build the inbound `options` describes, routing into `router`
pub fn new(router: &Arc<Router>, options: &InboundOptions) -> Result<InboundAdapter> {
    let listen = options
        .listen
        .ok_or_else(|| Error::Config(format!("inbound [{}] is missing a listen address", options.tag)))?;
    let listen = ListenOptions {
        listen,
        listen_port: options.listen_port,
        tcp_fast_open: options.tcp_fast_open,
    };
    let tag = if options.tag.is_empty() {
        options.inbound_type.clone()
    } else {
        options.tag.clone()
    };
    let users: Vec<Credentials> = options.users.iter().map(Credentials::from).collect();

    match options.inbound_type.as_str() {
        "direct" => {
            let networks = match options.network {
                Some(network) => vec![network],
                None => vec![Network::Tcp, Network::Udp],
            };
            let handler = Arc::new(DirectInbound::new(
                tag.clone(),
                router.clone(),
                listen.socket_addr(),
                options,
            ));
            Ok(InboundAdapter::new("direct", networks, tag, listen)
                .with_connection_handler(handler.clone())
                .with_packet_handler(handler))
        }
        "socks" | "http" => {
            if options.network == Some(Network::Udp) {
                return Err(Error::Config(format!(
                    "{} inbound [{}] does not support udp",
                    options.inbound_type, tag
                )));
            }
            let handler: Arc<dyn ConnectionHandler> = if options.inbound_type == "socks" {
                Arc::new(SocksInbound::new(tag.clone(), router.clone(), users, options.domain_strategy))
            } else {
                Arc::new(HttpInbound::new(tag.clone(), router.clone(), users, options.domain_strategy))
            };
            let protocol = if options.inbound_type == "socks" { "socks" } else { "http" };
            Ok(InboundAdapter::new(protocol, vec![Network::Tcp], tag, listen)
                .with_connection_handler(handler))
        }
        other => Err(Error::Config(format!("unknown inbound type: {}", other))),
    }
}
