//! Direct inbound - forwards everything to one fixed destination

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{ConnectionHandler, NatTable, PacketData, PacketHandler};
use crate::common::{Address, Metadata, PacketConn, SharedPacketConn, Stream};
use crate::config::InboundOptions;
use crate::dns::DomainStrategy;
use crate::error::Result;
use crate::route::Router;

pub struct DirectInbound {
    tag: String,
    router: Arc<Router>,
    destination: Address,
    domain_strategy: Option<DomainStrategy>,
    sessions: Arc<NatTable>,
}

impl DirectInbound {
    pub fn new(tag: String, router: Arc<Router>, listen: SocketAddr, options: &InboundOptions) -> Self {
        let port = options.override_port.unwrap_or(listen.port());
        let destination = match &options.override_address {
            Some(host) => match host.parse::<IpAddr>() {
                Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
                Err(_) => Address::domain(host.clone(), port),
            },
            None => Address::Socket(SocketAddr::new(listen.ip(), port)),
        };
        Self {
            tag,
            router,
            destination,
            domain_strategy: options.domain_strategy,
            sessions: Arc::new(NatTable::new()),
        }
    }

    pub fn destination(&self) -> &Address {
        &self.destination
    }

    /// Live UDP sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn prepare(&self, mut metadata: Metadata) -> Metadata {
        metadata.destination = self.destination.clone();
        metadata.domain_strategy = self.domain_strategy;
        metadata
    }
}

#[async_trait]
impl ConnectionHandler for DirectInbound {
    async fn new_connection(&self, stream: Stream, metadata: Metadata) -> Result<()> {
        let metadata = self.prepare(metadata);
        info!("[{}] inbound connection to {}", self.tag, metadata.destination);
        self.router.route_connection(stream, metadata).await
    }
}

#[async_trait]
impl PacketHandler for DirectInbound {
    async fn new_packet(
        &self,
        conn: SharedPacketConn,
        packet: PacketData<'_>,
        metadata: Metadata,
    ) -> Result<()> {
        let source = metadata.source;
        let (session, created) = self.sessions.get_or_create(source, &self.destination, &conn);

        if created {
            let metadata = self.prepare(metadata);
            info!("[{}] inbound packet connection to {}", self.tag, metadata.destination);

            let router = self.router.clone();
            let sessions = self.sessions.clone();
            let session = session.clone();
            let tag = self.tag.clone();
            tokio::spawn(async move {
                let conn: SharedPacketConn = session.clone();
                if let Err(e) = router.route_packet_connection(conn, metadata).await {
                    if e.is_closed() {
                        debug!("[{}] packet connection from {} closed", tag, source);
                    } else {
                        warn!("[{}] process packet connection from {}: {}", tag, source, e);
                    }
                }
                sessions.remove(&session);
                let _ = session.close();
            });
        }

        if !session.push(packet.into_bytes()) {
            debug!("[{}] session for {} is full, packet dropped", self.tag, source);
        }
        Ok(())
    }

    fn close(&self) {
        let count = self.sessions.len();
        self.sessions.close_all();
        debug!("[{}] {} udp sessions closed", self.tag, count);
    }
}

impl Drop for DirectInbound {
    fn drop(&mut self) {
        self.sessions.close_all();
    }
}
