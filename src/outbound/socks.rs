//! SOCKS5 outbound - CONNECT through an upstream SOCKS5 server

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, Span};

use super::direct::{connect_tcp, DEFAULT_CONNECT_TIMEOUT};
use super::{Outbound, OutboundKind};
use crate::common::{Address, IntoStream, Metadata, Network, Stream};
use crate::config::OutboundOptions;
use crate::dns::DomainStrategy;
use crate::error::{Error, Result};
use crate::protocol::{socks, Credentials};
use crate::route::Router;

/// Upstream server address from `server`/`server_port`
pub(crate) fn server_address(options: &OutboundOptions, kind: OutboundKind) -> Result<Address> {
    if options.server.is_empty() || options.server_port == 0 {
        return Err(Error::Config(format!(
            "{} outbound requires server and server_port",
            kind
        )));
    }
    Ok(match options.server.parse() {
        Ok(ip) => Address::Socket(std::net::SocketAddr::new(ip, options.server_port)),
        Err(_) => Address::Domain(options.server.clone(), options.server_port),
    })
}

pub struct SocksOutbound {
    tag: String,
    router: Weak<Router>,
    server: Address,
    credentials: Option<Credentials>,
    domain_strategy: Option<DomainStrategy>,
    connect_timeout: Duration,
    span: Span,
}

impl SocksOutbound {
    pub fn new(tag: String, router: Weak<Router>, options: &OutboundOptions, span: Span) -> Result<Self> {
        Ok(Self {
            tag,
            router,
            server: server_address(options, OutboundKind::Socks)?,
            credentials: Credentials::from_options(
                options.username.as_deref(),
                options.password.as_deref(),
            ),
            domain_strategy: options.domain_strategy,
            connect_timeout: options
                .connect_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            span,
        })
    }
}

#[async_trait]
impl Outbound for SocksOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> OutboundKind {
        OutboundKind::Socks
    }

    fn networks(&self) -> &[Network] {
        &[Network::Tcp]
    }

    fn span(&self) -> Span {
        self.span.clone()
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Stream> {
        let mut stream =
            connect_tcp(&self.router, &self.server, self.domain_strategy, self.connect_timeout).await?;
        socks::client_handshake(&mut stream, &metadata.destination, self.credentials.as_ref())
            .await
            .map_err(|e| e.cause(format!("socks handshake with {}", self.server)))?;
        debug!("[{}] connected to {} via {}", self.tag, metadata.destination, self.server);
        Ok(stream.into_stream())
    }

    fn early_data(&self) -> bool {
        true
    }
}
