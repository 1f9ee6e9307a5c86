//! HTTP proxy outbound - CONNECT through an upstream HTTP proxy

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, Span};

use super::direct::{connect_tcp, DEFAULT_CONNECT_TIMEOUT};
use super::socks::server_address;
use super::{Outbound, OutboundKind};
use crate::common::{Address, IntoStream, Metadata, Network, Stream};
use crate::config::OutboundOptions;
use crate::dns::DomainStrategy;
use crate::error::Result;
use crate::protocol::{http, Credentials};
use crate::route::Router;

pub struct HttpOutbound {
    tag: String,
    router: Weak<Router>,
    server: Address,
    credentials: Option<Credentials>,
    domain_strategy: Option<DomainStrategy>,
    connect_timeout: Duration,
    span: Span,
}

impl HttpOutbound {
    pub fn new(tag: String, router: Weak<Router>, options: &OutboundOptions, span: Span) -> Result<Self> {
        Ok(Self {
            tag,
            router,
            server: server_address(options, OutboundKind::Http)?,
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
impl Outbound for HttpOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> OutboundKind {
        OutboundKind::Http
    }

    fn networks(&self) -> &[Network] {
        &[Network::Tcp]
    }

    fn span(&self) -> Span {
        self.span.clone()
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Stream> {
        let stream =
            connect_tcp(&self.router, &self.server, self.domain_strategy, self.connect_timeout).await?;
        let stream = http::client_handshake(
            stream.into_stream(),
            &metadata.destination,
            self.credentials.as_ref(),
        )
        .await
        .map_err(|e| e.cause(format!("http connect via {}", self.server)))?;
        debug!("[{}] connected to {} via {}", self.tag, metadata.destination, self.server);
        Ok(stream)
    }

    fn early_data(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_through_http_proxy() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let (target, mut stream) = http::server_handshake(conn.into_stream(), &[]).await.unwrap();
            stream.write_all(b"tunnel").await.unwrap();
            target
        });

        let router = Router::from_config(&Config::default()).unwrap();
        let options: OutboundOptions = serde_json::from_str(&format!(
            r#"{{"type":"http","server":"127.0.0.1","server_port":{}}}"#,
            port
        ))
        .unwrap();
        let outbound =
            HttpOutbound::new("web".into(), Arc::downgrade(&router), &options, Span::none()).unwrap();

        let metadata = Metadata::default().with_destination(Address::domain("example.org", 443));
        let mut stream = outbound.dial(&metadata).await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel");
        assert_eq!(server.await.unwrap(), Address::domain("example.org", 443));
    }
}
