//! Selector outbound - relays through one manually chosen member

use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, Span};

use super::{Outbound, OutboundKind};
use crate::common::{Metadata, SharedPacketConn, Stream};
use crate::config::OutboundOptions;
use crate::error::{Error, Result};
use crate::route::Router;

/// Look up every member tag in the router's outbound table
pub(crate) fn resolve_members(
    router: &Weak<Router>,
    group: &str,
    tags: &[String],
) -> Result<Vec<Arc<dyn Outbound>>> {
    let router = router.upgrade().ok_or(Error::Closed)?;
    tags.iter()
        .map(|tag| {
            if tag == group {
                return Err(Error::Config(format!("{} lists itself as a member", group)));
            }
            router
                .outbound(tag)
                .ok_or_else(|| Error::OutboundNotFound(tag.clone()))
        })
        .collect()
}

pub struct SelectorOutbound {
    tag: String,
    router: Weak<Router>,
    member_tags: Vec<String>,
    default: Option<String>,
    members: OnceLock<Vec<Arc<dyn Outbound>>>,
    selected: RwLock<usize>,
    span: Span,
}

impl SelectorOutbound {
    pub fn new(tag: String, router: Weak<Router>, options: &OutboundOptions, span: Span) -> Result<Self> {
        if options.outbounds.is_empty() {
            return Err(Error::Config(format!("selector {} has no members", tag)));
        }
        Ok(Self {
            tag,
            router,
            member_tags: options.outbounds.clone(),
            default: options.default.clone(),
            members: OnceLock::new(),
            selected: RwLock::new(0),
            span,
        })
    }

    /// Switch to the member tagged `tag`; false when it is not a member
    pub fn select(&self, tag: &str) -> bool {
        match self.member_tags.iter().position(|t| t == tag) {
            Some(index) => {
                *self.selected.write() = index;
                info!("[{}] selected {}", self.tag, tag);
                true
            }
            None => false,
        }
    }

    pub fn selected_tag(&self) -> &str {
        &self.member_tags[*self.selected.read()]
    }

    pub fn member_tags(&self) -> &[String] {
        &self.member_tags
    }

    fn selected(&self) -> Result<Arc<dyn Outbound>> {
        let members = self
            .members
            .get()
            .ok_or_else(|| Error::OutboundNotFound(self.tag.clone()))?;
        Ok(members[*self.selected.read()].clone())
    }
}

#[async_trait]
impl Outbound for SelectorOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> OutboundKind {
        OutboundKind::Selector
    }

    fn span(&self) -> Span {
        self.span.clone()
    }

    fn start(&self) -> Result<()> {
        let members = resolve_members(&self.router, &self.tag, &self.member_tags)?;
        if let Some(default) = &self.default {
            if !self.select(default) {
                return Err(Error::Config(format!(
                    "selector {} default {} is not a member",
                    self.tag, default
                )));
            }
        }
        let _ = self.members.set(members);
        Ok(())
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Stream> {
        self.selected()?.dial(metadata).await
    }

    async fn listen_packet(&self, metadata: &Metadata) -> Result<SharedPacketConn> {
        self.selected()?.listen_packet(metadata).await
    }

    async fn new_connection(&self, stream: Stream, metadata: Metadata) -> Result<()> {
        self.selected()?.new_connection(stream, metadata).await
    }

    async fn new_packet_connection(&self, conn: SharedPacketConn, metadata: Metadata) -> Result<()> {
        self.selected()?.new_packet_connection(conn, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::outbound::{new, OutboundRegistry};

    fn build(router: &Arc<Router>, configs: &[&str]) -> Vec<Arc<dyn Outbound>> {
        configs
            .iter()
            .map(|json| {
                let options: OutboundOptions = serde_json::from_str(json).unwrap();
                new(router, &OutboundRegistry::new(), &options).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_start_resolves_members() {
        let router = Router::from_config(&Config::default()).unwrap();
        let outbounds = build(
            &router,
            &[
                r#"{"type":"direct","tag":"direct"}"#,
                r#"{"type":"block","tag":"block"}"#,
                r#"{"type":"selector","tag":"pick","outbounds":["direct","block"],"default":"block"}"#,
            ],
        );
        router.set_outbounds(outbounds).unwrap();
        router.start().unwrap();

        let pick = router.outbound("pick").unwrap();
        assert_eq!(pick.outbound_type(), OutboundKind::Selector);
    }

    #[test]
    fn test_start_fails_on_missing_member() {
        let router = Router::from_config(&Config::default()).unwrap();
        let options: OutboundOptions =
            serde_json::from_str(r#"{"type":"selector","tag":"pick","outbounds":["nowhere"]}"#).unwrap();
        let selector =
            SelectorOutbound::new("pick".into(), Arc::downgrade(&router), &options, Span::none()).unwrap();

        let err = selector.start().unwrap_err();
        assert!(matches!(err, Error::OutboundNotFound(tag) if tag == "nowhere"));
    }

    #[test]
    fn test_select_switches_member() {
        let router = Router::from_config(&Config::default()).unwrap();
        let options: OutboundOptions =
            serde_json::from_str(r#"{"type":"selector","outbounds":["a","b"]}"#).unwrap();
        let selector =
            SelectorOutbound::new("pick".into(), Arc::downgrade(&router), &options, Span::none()).unwrap();

        assert_eq!(selector.selected_tag(), "a");
        assert!(selector.select("b"));
        assert_eq!(selector.selected_tag(), "b");
        assert!(!selector.select("c"));
    }
}
