//! Common types and abstractions
//!
//! - Stream: duplex byte stream
//! - PacketConn: addressed datagram connection
//! - Metadata: per-flow routing context
//! - Address: destination address

mod address;
mod metadata;
mod packet;
mod stream;

pub use address::Address;
pub use metadata::{Metadata, Network};
pub use packet::{PacketConn, SharedPacketConn, MAX_PACKET_SIZE};
pub use stream::{AsyncReadWrite, IntoStream, PrefixedStream, Stream};

pub use crate::error::{Error, Result};
