//! HTTP proxy inbound: CONNECT tunnels and plain forwarded requests

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::ConnectionHandler;
use crate::common::{Metadata, Stream};
use crate::dns::DomainStrategy;
use crate::error::Result;
use crate::protocol::{http, Credentials};
use crate::route::Router;

pub struct HttpInbound {
    tag: String,
    router: Arc<Router>,
    users: Vec<Credentials>,
    domain_strategy: Option<DomainStrategy>,
}

impl HttpInbound {
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
impl ConnectionHandler for HttpInbound {
    async fn new_connection(&self, stream: Stream, mut metadata: Metadata) -> Result<()> {
        let (destination, stream) = http::server_handshake(stream, &self.users)
            .await
            .map_err(|e| e.cause("http handshake"))?;
        info!("[{}] inbound connection to {}", self.tag, destination);

        metadata.destination = destination;
        metadata.domain_strategy = self.domain_strategy;
        self.router.route_connection(stream, metadata).await
    }
}
