//! Flowgate - a programmable proxy router
//!
//! # Architecture
//!
//! ```text
//! Inbound (direct/socks/http)
//! → Router (rules, DNS)
//! → Outbound (direct/block/socks/http/selector/urltest)
//! → Tunnel (stream / packet relay)
//! ```
//!
//! Inbounds turn accepted sockets into `Stream` / `PacketConn` plus
//! `Metadata`; the router only looks at `Metadata` to pick an outbound; the
//! outbound dials and relays.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, PacketConn, Metadata, Address
//! ├── dns/             # DNS transports and message helpers
//! ├── inbound/         # Listening adapters and inbound protocols
//! ├── outbound/        # Outbound trait, construction dispatcher, protocols
//! ├── protocol/        # SOCKS5 / HTTP proxy handshakes
//! ├── route/           # Router, rules, geo databases
//! ├── tunnel/          # Bidirectional relays
//! └── app/             # Instance lifecycle, metrics
//! ```

// Core types
pub mod common;
pub mod error;

pub mod dns;
pub mod inbound;
pub mod outbound;
pub mod protocol;
pub mod route;
pub mod tunnel;
pub mod app;

pub mod config;

// Re-exports for convenience
pub use common::{Address, Metadata, Network, PacketConn, Stream};
pub use config::Config;
pub use error::{Error, Result};

pub use app::Instance;
pub use inbound::InboundAdapter;
pub use outbound::{Outbound, OutboundRegistry};
pub use route::Router;
