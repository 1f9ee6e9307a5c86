//! Block outbound - drops every flow routed to it

use async_trait::async_trait;
use tracing::{info, Span};

use super::{Outbound, OutboundKind};
use crate::common::{Metadata, SharedPacketConn, Stream};
use crate::error::{Error, Result};

pub struct BlockOutbound {
    tag: String,
    span: Span,
}

impl BlockOutbound {
    pub fn new(tag: String, span: Span) -> Self {
        Self { tag, span }
    }
}

#[async_trait]
impl Outbound for BlockOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> OutboundKind {
        OutboundKind::Block
    }

    fn span(&self) -> Span {
        self.span.clone()
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Stream> {
        Err(Error::Protocol(format!("blocked connection to {}", metadata.destination)))
    }

    async fn new_connection(&self, stream: Stream, metadata: Metadata) -> Result<()> {
        drop(stream);
        info!("[{}] blocked connection to {}", self.tag, metadata.destination);
        Ok(())
    }

    async fn new_packet_connection(&self, conn: SharedPacketConn, metadata: Metadata) -> Result<()> {
        conn.close()?;
        info!("[{}] blocked packet connection from {}", self.tag, metadata.source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, IntoStream};
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_block_closes_stream() {
        let outbound = BlockOutbound::new("block".into(), Span::none());
        let (mut peer, stream) = duplex(64);
        let metadata = Metadata::default().with_destination(Address::domain("ads.example.com", 443));

        outbound.new_connection(stream.into_stream(), metadata.clone()).await.unwrap();

        let mut buf = Vec::new();
        assert_eq!(peer.read_to_end(&mut buf).await.unwrap(), 0);
        assert!(outbound.dial(&metadata).await.is_err());
    }
}
