//! Router - the single decision point every inbound calls into
//!
//! ```text
//! Metadata ──rules (first match)──▶ outbound tag ──table──▶ Outbound
//!                 └── no match ──▶ final outbound
//! ```
//!
//! The router also owns DNS: transport selection through DNS rules, the
//! exchange timeout and answer logging. Rules, DNS tables and the outbound
//! table are fixed once built and read without locks.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use hickory_proto::op::Message;
use tracing::{debug, error, info, Instrument};

use super::geo::{GeoIpReader, GeositeReader};
use super::rule::{DefaultRule, DnsRule, Rule};
use crate::app::metrics::{
    DNS_FAILURES_TOTAL, DNS_QUERIES_TOTAL, OUTBOUND_CONNECTIONS_TOTAL, ROUTER_DECISIONS_TOTAL,
    ROUTER_RULE_HITS,
};
use crate::common::{Metadata, SharedPacketConn, Stream};
use crate::config::Config;
use crate::dns::{
    format_question, log_dns_answers, new_transport, DnsTransport, DomainStrategy, LocalTransport,
    DNS_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::outbound::Outbound;

struct OutboundTable {
    by_tag: HashMap<String, Arc<dyn Outbound>>,
    ordered: Vec<Arc<dyn Outbound>>,
}

pub struct Router {
    rules: Vec<Box<dyn Rule>>,
    dns_rules: Vec<DnsRule>,
    outbounds: OnceLock<OutboundTable>,
    final_outbound: Option<String>,
    transports: HashMap<String, Arc<dyn DnsTransport>>,
    default_transport: Arc<dyn DnsTransport>,
    default_strategy: DomainStrategy,
    dns_timeout: Duration,
    geoip: Option<Arc<GeoIpReader>>,
    geosite: Option<Arc<GeositeReader>>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// Build rules, DNS transports and geo databases from `config`.
    ///
    /// The outbound table is registered afterwards with `set_outbounds`,
    /// since outbounds are bound to the router they are built for.
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let geoip = match &config.route.geoip {
            Some(path) => Some(Arc::new(GeoIpReader::load(path)?)),
            None => None,
        };
        let geosite = match &config.route.geosite {
            Some(path) => Some(Arc::new(GeositeReader::load(path)?)),
            None => None,
        };

        let mut builder = Router::builder()
            .domain_strategy(config.dns.strategy)
            .dns_timeout(config.dns.timeout.map(Duration::from_secs).unwrap_or(DNS_TIMEOUT));

        for options in &config.route.rules {
            builder = builder.rule(Box::new(DefaultRule::new(
                options,
                geoip.clone(),
                geosite.clone(),
            )?));
        }
        for server in &config.dns.servers {
            builder = builder.transport(new_transport(&server.tag, &server.address)?);
        }
        for options in &config.dns.rules {
            builder = builder.dns_rule(DnsRule::new(options, geosite.clone())?);
        }
        if let Some(tag) = &config.route.final_outbound {
            builder = builder.final_outbound(tag);
        }
        if let Some(tag) = &config.dns.final_server {
            builder = builder.final_transport(tag);
        }
        if let Some(reader) = geoip {
            builder = builder.geoip(reader);
        }
        if let Some(reader) = geosite {
            builder = builder.geosite(reader);
        }

        builder.build()
    }

    /// Install the outbound table; allowed once
    pub fn set_outbounds(&self, outbounds: Vec<Arc<dyn Outbound>>) -> Result<()> {
        let mut by_tag = HashMap::new();
        for outbound in &outbounds {
            if by_tag.insert(outbound.tag().to_string(), outbound.clone()).is_some() {
                return Err(Error::Config(format!("duplicate outbound tag: {}", outbound.tag())));
            }
        }
        if let Some(tag) = &self.final_outbound {
            if !by_tag.contains_key(tag) {
                return Err(Error::OutboundNotFound(tag.clone()));
            }
        }

        self.outbounds
            .set(OutboundTable {
                by_tag,
                ordered: outbounds,
            })
            .map_err(|_| Error::Config("outbounds already registered".into()))
    }

    pub fn outbound(&self, tag: &str) -> Option<Arc<dyn Outbound>> {
        self.outbounds.get()?.by_tag.get(tag).cloned()
    }

    /// All outbounds in registration order
    pub fn outbounds(&self) -> Vec<Arc<dyn Outbound>> {
        self.outbounds
            .get()
            .map(|table| table.ordered.clone())
            .unwrap_or_default()
    }

    /// The `final` outbound, or the first registered one
    pub fn default_outbound(&self) -> Option<Arc<dyn Outbound>> {
        self.outbound(self.default_tag()?)
    }

    fn default_tag(&self) -> Option<&str> {
        match &self.final_outbound {
            Some(tag) => Some(tag),
            None => self.outbounds.get()?.ordered.first().map(|o| o.tag()),
        }
    }

    /// Evaluate rules in order and return the target tag.
    ///
    /// The first matching rule wins and later rules are not evaluated; its
    /// strategy override, if any, is written into `metadata`. `None` only
    /// when nothing matches and there is no default outbound.
    pub fn select(&self, metadata: &mut Metadata) -> Option<&str> {
        ROUTER_DECISIONS_TOTAL.inc();

        for rule in &self.rules {
            if rule.matches(metadata) {
                ROUTER_RULE_HITS.with_label_values(&[&rule.to_string()]).inc();
                if let Some(strategy) = rule.domain_strategy() {
                    metadata.domain_strategy = Some(strategy);
                }
                debug!(
                    "[router] {} matched rule [{}] => {}",
                    metadata.destination,
                    rule,
                    rule.outbound()
                );
                return Some(rule.outbound());
            }
        }

        let tag = self.default_tag();
        debug!("[router] {} matched no rule => {:?}", metadata.destination, tag);
        tag
    }

    /// Outbound for this flow; missing outbound is `OutboundNotFound`
    pub fn match_outbound(&self, metadata: &mut Metadata) -> Result<Arc<dyn Outbound>> {
        let tag = self
            .select(metadata)
            .ok_or_else(|| Error::OutboundNotFound("default".into()))?;
        let outbound = self
            .outbound(tag)
            .ok_or_else(|| Error::OutboundNotFound(tag.to_string()))?;

        if !outbound.networks().contains(&metadata.network) {
            return Err(Error::Unsupported(format!(
                "{} outbound {} does not handle {}",
                outbound.outbound_type(),
                outbound.tag(),
                metadata.network
            )));
        }
        Ok(outbound)
    }

    /// Route an accepted stream and relay it through the chosen outbound
    pub async fn route_connection(&self, stream: Stream, mut metadata: Metadata) -> Result<()> {
        let outbound = self.match_outbound(&mut metadata)?;
        OUTBOUND_CONNECTIONS_TOTAL
            .with_label_values(&[outbound.tag()])
            .inc();
        info!(
            "[{}] {} -> {} via [{}]",
            metadata.inbound_tag,
            metadata.source,
            metadata.destination,
            outbound.tag()
        );

        let span = outbound.span();
        outbound.new_connection(stream, metadata).instrument(span).await
    }

    /// Route a packet connection; it is closed when no outbound takes it
    pub async fn route_packet_connection(
        &self,
        conn: SharedPacketConn,
        mut metadata: Metadata,
    ) -> Result<()> {
        let outbound = match self.match_outbound(&mut metadata) {
            Ok(outbound) => outbound,
            Err(e) => {
                let _ = conn.close();
                return Err(e);
            }
        };
        OUTBOUND_CONNECTIONS_TOTAL
            .with_label_values(&[outbound.tag()])
            .inc();
        info!(
            "[{}] packet connection from {} to {} via [{}]",
            metadata.inbound_tag,
            metadata.source,
            metadata.destination,
            outbound.tag()
        );

        let span = outbound.span();
        outbound
            .new_packet_connection(conn, metadata)
            .instrument(span)
            .await
    }

    /// Pick a DNS transport: first DNS rule that matches, default otherwise
    pub fn match_dns(
        &self,
        domain: Option<&str>,
        inbound_tag: Option<&str>,
    ) -> (&Arc<dyn DnsTransport>, Option<DomainStrategy>) {
        for rule in &self.dns_rules {
            if rule.matches(domain, inbound_tag) {
                if let Some(transport) = self.transports.get(rule.server()) {
                    return (transport, rule.strategy());
                }
            }
        }
        (&self.default_transport, None)
    }

    /// Forward a raw DNS message; bounded by the DNS timeout, never retried
    pub async fn exchange(&self, message: &Message, inbound_tag: Option<&str>) -> Result<Message> {
        let question = message.queries().first();
        let name = question
            .map(|q| q.name().to_string())
            .unwrap_or_default();
        if let Some(question) = question {
            debug!("[dns] exchange {}", format_question(question));
        }

        let domain = name.trim_end_matches('.');
        let (transport, _) = self.match_dns(Some(domain).filter(|d| !d.is_empty()), inbound_tag);
        DNS_QUERIES_TOTAL.with_label_values(&[transport.tag()]).inc();

        let result = match tokio::time::timeout(self.dns_timeout, transport.exchange(message)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match &result {
            Ok(response) => log_dns_answers(&name, response.answers()),
            Err(e) => {
                DNS_FAILURES_TOTAL.with_label_values(&[transport.tag()]).inc();
                error!("[dns] exchange failed for {}: {}", name, e);
            }
        }
        result
    }

    /// Resolve `domain` to addresses.
    ///
    /// An explicit strategy wins; `AsIs` defers to the matched DNS rule's
    /// strategy when it sets one.
    pub async fn lookup(&self, domain: &str, strategy: DomainStrategy) -> Result<Vec<IpAddr>> {
        let (transport, rule_strategy) = self.match_dns(Some(domain), None);
        let strategy = match strategy {
            DomainStrategy::AsIs => rule_strategy.unwrap_or(strategy),
            explicit => explicit,
        };
        DNS_QUERIES_TOTAL.with_label_values(&[transport.tag()]).inc();

        let result = match tokio::time::timeout(self.dns_timeout, transport.lookup(domain, strategy)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        };

        match &result {
            Ok(addrs) => {
                let joined = addrs
                    .iter()
                    .map(|ip| ip.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                info!("[dns] lookup succeed for {}: {}", domain, joined);
            }
            Err(e) => {
                DNS_FAILURES_TOTAL.with_label_values(&[transport.tag()]).inc();
                error!("[dns] lookup failed for {}: {}", domain, e);
            }
        }
        result
    }

    pub async fn lookup_default(&self, domain: &str) -> Result<Vec<IpAddr>> {
        self.lookup(domain, self.default_strategy).await
    }

    pub fn default_strategy(&self) -> DomainStrategy {
        self.default_strategy
    }

    pub fn geoip_reader(&self) -> Option<&Arc<GeoIpReader>> {
        self.geoip.as_ref()
    }

    pub fn geosite_reader(&self) -> Option<&Arc<GeositeReader>> {
        self.geosite.as_ref()
    }

    /// Start outbounds, then rules, then DNS rules; stops at the first error
    pub fn start(&self) -> Result<()> {
        for outbound in self.outbounds() {
            outbound
                .start()
                .map_err(|e| e.cause(format!("start outbound [{}]", outbound.tag())))?;
        }
        for rule in &self.rules {
            rule.start()
                .map_err(|e| e.cause(format!("start rule [{}]", rule)))?;
        }
        for rule in &self.dns_rules {
            rule.start()
                .map_err(|e| e.cause(format!("start dns rule [{}]", rule.server())))?;
        }
        info!(
            "[router] started with {} rules, {} outbounds",
            self.rules.len(),
            self.outbounds().len()
        );
        Ok(())
    }

    /// Close rules and outbounds; every failure is logged, the first returned
    pub fn close(&self) -> Result<()> {
        let mut first_error = None;

        for rule in &self.rules {
            if let Err(e) = rule.close() {
                error!("[router] close rule [{}]: {}", rule, e);
                first_error.get_or_insert(e);
            }
        }
        for outbound in self.outbounds() {
            if let Err(e) = outbound.close() {
                error!("[router] close outbound [{}]: {}", outbound.tag(), e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Collects rules and DNS settings for a `Router`
#[derive(Default)]
pub struct RouterBuilder {
    rules: Vec<Box<dyn Rule>>,
    dns_rules: Vec<DnsRule>,
    final_outbound: Option<String>,
    transports: Vec<Arc<dyn DnsTransport>>,
    final_transport: Option<String>,
    default_strategy: DomainStrategy,
    dns_timeout: Option<Duration>,
    geoip: Option<Arc<GeoIpReader>>,
    geosite: Option<Arc<GeositeReader>>,
}

impl RouterBuilder {
    pub fn rule(mut self, rule: Box<dyn Rule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn dns_rule(mut self, rule: DnsRule) -> Self {
        self.dns_rules.push(rule);
        self
    }

    pub fn final_outbound(mut self, tag: impl Into<String>) -> Self {
        self.final_outbound = Some(tag.into());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn DnsTransport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn final_transport(mut self, tag: impl Into<String>) -> Self {
        self.final_transport = Some(tag.into());
        self
    }

    pub fn domain_strategy(mut self, strategy: DomainStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn dns_timeout(mut self, timeout: Duration) -> Self {
        self.dns_timeout = Some(timeout);
        self
    }

    pub fn geoip(mut self, reader: Arc<GeoIpReader>) -> Self {
        self.geoip = Some(reader);
        self
    }

    pub fn geosite(mut self, reader: Arc<GeositeReader>) -> Self {
        self.geosite = Some(reader);
        self
    }

    /// Default transport: `final_transport`, else the first configured one,
    /// else the system resolver
    pub fn build(self) -> Result<Arc<Router>> {
        let mut transports = HashMap::new();
        for transport in &self.transports {
            let tag = transport.tag().to_string();
            if transports.insert(tag.clone(), transport.clone()).is_some() {
                return Err(Error::Config(format!("duplicate dns server tag: {}", tag)));
            }
        }

        let default_transport = match &self.final_transport {
            Some(tag) => transports
                .get(tag)
                .cloned()
                .ok_or_else(|| Error::Config(format!("unknown dns server: {}", tag)))?,
            None => match self.transports.first() {
                Some(transport) => transport.clone(),
                None => Arc::new(LocalTransport::new("local")),
            },
        };

        for rule in &self.dns_rules {
            if !transports.contains_key(rule.server()) {
                return Err(Error::Config(format!("unknown dns server: {}", rule.server())));
            }
        }

        Ok(Arc::new(Router {
            rules: self.rules,
            dns_rules: self.dns_rules,
            outbounds: OnceLock::new(),
            final_outbound: self.final_outbound,
            transports,
            default_transport,
            default_strategy: self.default_strategy,
            dns_timeout: self.dns_timeout.unwrap_or(DNS_TIMEOUT),
            geoip: self.geoip,
            geosite: self.geosite,
        }))
    }
}
