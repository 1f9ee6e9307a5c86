//! Outbound adapters and the construction dispatcher
//!
//! ```text
//! OutboundOptions ──new()──▶ Arc<dyn Outbound> ──▶ Router outbound table
//! ```
//!
//! Every outbound honours one contract: take a stream or packet connection
//! plus its metadata and relay it, returning the first error. How a given
//! adapter dials is its own business.

mod block;
mod builder;
mod direct;
mod http;
mod selector;
mod socks;
mod urltest;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use tracing::{debug, Span};

use crate::common::{Metadata, Network, SharedPacketConn, Stream};
use crate::error::{Error, Result};
use crate::tunnel::{copy_conn, copy_early_conn, copy_packet};

pub use block::BlockOutbound;
pub use builder::{new, OutboundRegistry, ProtocolProvider};
pub use direct::{DirectOutbound, DirectPacketConn};
pub use http::HttpOutbound;
pub use selector::SelectorOutbound;
pub use socks::SocksOutbound;
pub use urltest::UrlTestOutbound;

/// Networks an outbound handles unless it says otherwise
pub const ALL_NETWORKS: &[Network] = &[Network::Tcp, Network::Udp];

/// Tracing span every outbound's work runs under
pub fn outbound_span(tag: &str) -> Span {
    tracing::info_span!("outbound", tag = %tag)
}

/// Outbound relay capability
#[async_trait]
pub trait Outbound: Send + Sync {
    fn tag(&self) -> &str;

    fn outbound_type(&self) -> OutboundKind;

    fn networks(&self) -> &[Network] {
        ALL_NETWORKS
    }

    /// Span the router enters while this outbound handles a flow
    fn span(&self) -> Span {
        outbound_span(self.tag())
    }

    /// Called once after the whole outbound table is registered
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Open a stream to `metadata.destination`
    async fn dial(&self, metadata: &Metadata) -> Result<Stream>;

    /// Open a packet connection for datagrams of this flow
    async fn listen_packet(&self, _metadata: &Metadata) -> Result<SharedPacketConn> {
        Err(Error::Unsupported(format!(
            "{} outbound does not relay udp",
            self.outbound_type()
        )))
    }

    /// Whether the client's first payload should be flushed right behind the
    /// outbound handshake, see `tunnel::copy_early_conn`
    fn early_data(&self) -> bool {
        false
    }

    /// Relay an inbound stream through this outbound
    async fn new_connection(&self, stream: Stream, metadata: Metadata) -> Result<()> {
        let remote = self.dial(&metadata).await?;
        debug!("[{}] relaying {} -> {}", self.tag(), metadata.source, metadata.destination);
        if self.early_data() {
            copy_early_conn(stream, remote).await?;
        } else {
            copy_conn(stream, remote).await?;
        }
        Ok(())
    }

    /// Relay an inbound packet connection through this outbound
    async fn new_packet_connection(&self, conn: SharedPacketConn, metadata: Metadata) -> Result<()> {
        let remote = match self.listen_packet(&metadata).await {
            Ok(remote) => remote,
            Err(e) => {
                let _ = conn.close();
                return Err(e);
            }
        };
        debug!("[{}] relaying packets from {}", self.tag(), metadata.source);
        copy_packet(conn, remote).await
    }
}

/// Outbound protocol kinds the dispatcher recognises
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboundKind {
    Direct,
    Block,
    Socks,
    Http,
    Selector,
    UrlTest,
    Shadowsocks,
    Vmess,
}

impl OutboundKind {
    /// Kinds implemented in this crate; the rest need a registered provider
    pub fn is_builtin(&self) -> bool {
        !matches!(self, OutboundKind::Shadowsocks | OutboundKind::Vmess)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundKind::Direct => "direct",
            OutboundKind::Block => "block",
            OutboundKind::Socks => "socks",
            OutboundKind::Http => "http",
            OutboundKind::Selector => "selector",
            OutboundKind::UrlTest => "urltest",
            OutboundKind::Shadowsocks => "shadowsocks",
            OutboundKind::Vmess => "vmess",
        }
    }
}

impl fmt::Display for OutboundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboundKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(OutboundKind::Direct),
            "block" => Ok(OutboundKind::Block),
            "socks" => Ok(OutboundKind::Socks),
            "http" => Ok(OutboundKind::Http),
            "selector" => Ok(OutboundKind::Selector),
            "urltest" => Ok(OutboundKind::UrlTest),
            "shadowsocks" => Ok(OutboundKind::Shadowsocks),
            "vmess" => Ok(OutboundKind::Vmess),
            other => Err(Error::UnknownOutboundType(other.to_string())),
        }
    }
}
