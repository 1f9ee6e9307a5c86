//! SOCKS5 inbound (CONNECT only)

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::ConnectionHandler;
use crate::common::{Metadata, Stream};
use crate::dns::DomainStrategy;
use crate::error::Result;
use crate::protocol::{socks, Credentials};
use crate::route::Router;

pub struct SocksInbound {
    tag: String,
    router: Arc<Router>,
    users: Vec<Credentials>,
    domain_strategy: Option<DomainStrategy>,
}

impl SocksInbound {
    pub fn new(
        tag: String,
        router: Arc<Router>,
        users: Vec<Credentials>,
        domain_strategy: Option<DomainStrategy>,
    ) -> Self {
        Self {
            tag,
            router,
            users,
            domain_strategy,
        }
    }
}

#[async_trait]
impl ConnectionHandler for SocksInbound {
    async fn new_connection(&self, mut stream: Stream, mut metadata: Metadata) -> Result<()> {
        let destination = socks::server_handshake(&mut stream, &self.users)
            .await
            .map_err(|e| e.cause("socks handshake"))?;
        info!("[{}] inbound connection to {}", self.tag, destination);

        metadata.destination = destination;
        metadata.domain_strategy = self.domain_strategy;
        self.router.route_connection(stream, metadata).await
    }
}
