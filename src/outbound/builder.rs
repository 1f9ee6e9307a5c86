//! Outbound construction: type string → live adapter

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::debug;

use super::{
    outbound_span, BlockOutbound, DirectOutbound, HttpOutbound, Outbound, OutboundKind,
    SelectorOutbound, SocksOutbound, UrlTestOutbound,
};
use crate::config::OutboundOptions;
use crate::error::{Error, Result};
use crate::route::Router;

/// Builds outbounds for a protocol this crate does not implement itself
pub trait ProtocolProvider: Send + Sync {
    fn build(&self, router: Weak<Router>, options: &OutboundOptions) -> Result<Arc<dyn Outbound>>;
}

/// Providers for externally implemented outbound kinds
#[derive(Clone, Default)]
pub struct OutboundRegistry {
    providers: HashMap<OutboundKind, Arc<dyn ProtocolProvider>>,
}

impl OutboundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for `kind`. Built-in kinds always use their own
    /// constructor, so registering one is a configuration error.
    pub fn register(&mut self, kind: OutboundKind, provider: Arc<dyn ProtocolProvider>) -> Result<()> {
        if kind.is_builtin() {
            return Err(Error::Config(format!("{} outbound is built in", kind)));
        }
        self.providers.insert(kind, provider);
        Ok(())
    }

    pub fn provider(&self, kind: OutboundKind) -> Option<&Arc<dyn ProtocolProvider>> {
        self.providers.get(&kind)
    }
}

/// Build the outbound `options` describes, bound to `router`.
///
/// Group members are not checked here; selector and urltest resolve them at
/// their own `start()`.
pub fn new(
    router: &Arc<Router>,
    registry: &OutboundRegistry,
    options: &OutboundOptions,
) -> Result<Arc<dyn Outbound>> {
    if options.is_empty() {
        return Err(Error::EmptyOutbound);
    }

    let kind: OutboundKind = options.outbound_type.parse()?;
    let router = Arc::downgrade(router);
    let tag = options.effective_tag().to_string();
    let span = outbound_span(&tag);
    debug!("[{}] building {} outbound", tag, kind);

    let outbound: Arc<dyn Outbound> = match kind {
        OutboundKind::Direct => Arc::new(DirectOutbound::new(tag, router, options, span)),
        OutboundKind::Block => Arc::new(BlockOutbound::new(tag, span)),
        OutboundKind::Socks => Arc::new(SocksOutbound::new(tag, router, options, span)?),
        OutboundKind::Http => Arc::new(HttpOutbound::new(tag, router, options, span)?),
        OutboundKind::Selector => Arc::new(SelectorOutbound::new(tag, router, options, span)?),
        OutboundKind::UrlTest => Arc::new(UrlTestOutbound::new(tag, router, options, span)?),
        OutboundKind::Shadowsocks | OutboundKind::Vmess => {
            let provider = registry.provider(kind).ok_or_else(|| {
                Error::Unsupported(format!("{} outbound requires a registered provider", kind))
            })?;
            provider.build(router, options)?
        }
    };

    Ok(outbound)
}
