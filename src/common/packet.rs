//! Packet connection abstraction
//!
//! A packet connection carries discrete datagrams, each tagged with the
//! remote address it came from or is going to.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::Address;
use crate::error::Result;

/// Largest datagram read in one call
pub const MAX_PACKET_SIZE: usize = 65535;

/// Datagram read/write contract shared by inbounds and outbounds
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Read one datagram into `buf`, returning its length and address
    async fn read_packet(&self, buf: &mut [u8]) -> Result<(usize, Address)>;

    /// Send one datagram to `destination`
    async fn write_packet(&self, payload: Bytes, destination: Address) -> Result<()>;

    /// Close the connection; pending and later calls fail with a closed error
    fn close(&self) -> Result<()>;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// Whether concurrent `write_packet` calls must be serialized by the caller
    fn write_is_thread_unsafe(&self) -> bool {
        false
    }
}

pub type SharedPacketConn = Arc<dyn PacketConn>;
