//! URL-test outbound - relays through the member with the lowest probe delay
//!
//! Every member is probed with an HTTP GET over its own `dial` on a fixed
//! interval. The current member is kept unless another one beats it by more
//! than `tolerance`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

use super::selector::resolve_members;
use super::{Outbound, OutboundKind};
use crate::common::{Address, Metadata, Network, SharedPacketConn, Stream};
use crate::config::OutboundOptions;
use crate::error::{Error, Result};
use crate::protocol::http::parse_host_port;
use crate::route::Router;

const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(180);
const DEFAULT_TOLERANCE: Duration = Duration::from_millis(50);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and what to request when probing
#[derive(Debug, Clone, PartialEq)]
struct ProbeTarget {
    address: Address,
    host: String,
    path: String,
}

impl ProbeTarget {
    fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| Error::Config(format!("urltest only probes http:// urls: {}", url)))?;
        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        let address = parse_host_port(authority, 80)
            .map_err(|_| Error::Config(format!("invalid urltest url: {}", url)))?;
        Ok(Self {
            address,
            host: authority.to_string(),
            path: path.to_string(),
        })
    }

    fn request(&self) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: flowgate\r\nConnection: close\r\n\r\n",
            self.path, self.host
        )
    }
}

/// State shared with the probe task once members are resolved
struct UrlTestGroup {
    tag: String,
    members: Vec<Arc<dyn Outbound>>,
    target: ProbeTarget,
    tolerance: Duration,
    selected: RwLock<Option<Arc<dyn Outbound>>>,
    delays: RwLock<HashMap<String, Duration>>,
}

impl UrlTestGroup {
    async fn probe(&self, member: &Arc<dyn Outbound>) -> Result<Duration> {
        let metadata = Metadata::new(
            self.tag.clone(),
            Network::Tcp,
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        )
        .with_destination(self.target.address.clone());

        let start = Instant::now();
        tokio::time::timeout(PROBE_TIMEOUT, async {
            let mut stream = member.dial(&metadata).await?;
            stream.write_all(self.target.request().as_bytes()).await?;
            stream.flush().await?;
            let mut first = [0u8; 1];
            if stream.read(&mut first).await? == 0 {
                return Err(Error::Closed);
            }
            Ok::<(), Error>(())
        })
        .await??;
        Ok(start.elapsed())
    }

    /// Probe every member once and update the selection
    async fn check(&self) {
        let results = join_all(self.members.iter().map(|m| self.probe(m))).await;

        let mut delays = HashMap::new();
        for (member, result) in self.members.iter().zip(results) {
            match result {
                Ok(delay) => {
                    debug!("[{}] {} delay {}ms", self.tag, member.tag(), delay.as_millis());
                    delays.insert(member.tag().to_string(), delay);
                }
                Err(e) => debug!("[{}] {} probe failed: {}", self.tag, member.tag(), e),
            }
        }

        let fastest = self
            .members
            .iter()
            .filter_map(|m| delays.get(m.tag()).map(|d| (m, *d)))
            .min_by_key(|(_, d)| *d);

        let mut selected = self.selected.write();
        match fastest {
            None => {
                if selected.is_some() {
                    warn!("[{}] no member passed the probe", self.tag);
                }
                *selected = None;
            }
            Some((member, delay)) => {
                let keep = selected
                    .as_ref()
                    .and_then(|current| delays.get(current.tag()))
                    .is_some_and(|current| *current <= delay + self.tolerance);
                if !keep {
                    info!("[{}] switched to {} ({}ms)", self.tag, member.tag(), delay.as_millis());
                    *selected = Some(member.clone());
                }
            }
        }
        drop(selected);

        *self.delays.write() = delays;
    }
}

pub struct UrlTestOutbound {
    tag: String,
    router: Weak<Router>,
    member_tags: Vec<String>,
    target: ProbeTarget,
    interval: Duration,
    tolerance: Duration,
    group: OnceLock<Arc<UrlTestGroup>>,
    task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl UrlTestOutbound {
    pub fn new(tag: String, router: Weak<Router>, options: &OutboundOptions, span: Span) -> Result<Self> {
        if options.outbounds.is_empty() {
            return Err(Error::Config(format!("urltest {} has no members", tag)));
        }
        Ok(Self {
            tag,
            router,
            member_tags: options.outbounds.clone(),
            target: ProbeTarget::parse(options.url.as_deref().unwrap_or(DEFAULT_TEST_URL))?,
            interval: options
                .interval
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_INTERVAL),
            tolerance: options
                .tolerance
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TOLERANCE),
            group: OnceLock::new(),
            task: Mutex::new(None),
            span,
        })
    }

    /// Probe all members now
    pub async fn check(&self) -> Result<()> {
        let group = self
            .group
            .get()
            .ok_or_else(|| Error::OutboundNotFound(self.tag.clone()))?;
        group.check().await;
        Ok(())
    }

    /// Last measured delay per member tag
    pub fn delays(&self) -> HashMap<String, Duration> {
        self.group
            .get()
            .map(|group| group.delays.read().clone())
            .unwrap_or_default()
    }

    fn selected(&self) -> Result<Arc<dyn Outbound>> {
        self.group
            .get()
            .and_then(|group| group.selected.read().clone())
            .ok_or_else(|| Error::OutboundNotFound(self.tag.clone()))
    }
}

#[async_trait]
impl Outbound for UrlTestOutbound {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn outbound_type(&self) -> OutboundKind {
        OutboundKind::UrlTest
    }

    fn span(&self) -> Span {
        self.span.clone()
    }

    /// Resolves members, selects the first one until a probe says otherwise
    /// and starts the probe loop
    fn start(&self) -> Result<()> {
        let members = resolve_members(&self.router, &self.tag, &self.member_tags)?;
        let group = Arc::new(UrlTestGroup {
            tag: self.tag.clone(),
            selected: RwLock::new(members.first().cloned()),
            members,
            target: self.target.clone(),
            tolerance: self.tolerance,
            delays: RwLock::new(HashMap::new()),
        });
        if self.group.set(group.clone()).is_err() {
            return Ok(());
        }

        let interval = self.interval;
        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    group.check().await;
                }
            }
            .instrument(self.span.clone()),
        );
        *self.task.lock() = Some(handle);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
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
    use tokio::net::TcpListener;

    #[test]
    fn test_probe_target_parse() {
        let target = ProbeTarget::parse("http://127.0.0.1:8080/generate_204").unwrap();
        assert_eq!(target.address, Address::Socket("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(target.path, "/generate_204");
        assert!(target.request().starts_with("GET /generate_204 HTTP/1.1\r\nHost: 127.0.0.1:8080\r\n"));

        let target = ProbeTarget::parse("http://example.com").unwrap();
        assert_eq!(target.address, Address::domain("example.com", 80));
        assert_eq!(target.path, "/");

        assert!(ProbeTarget::parse("https://example.com").is_err());
    }

    #[tokio::test]
    async fn test_selects_healthy_member() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = conn.read(&mut buf).await;
                    let _ = conn.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await;
                });
            }
        });

        let router = Router::from_config(&Config::default()).unwrap();
        let configs = [
            r#"{"type":"block","tag":"dead"}"#.to_string(),
            r#"{"type":"direct","tag":"alive"}"#.to_string(),
            format!(
                r#"{{"type":"urltest","tag":"auto","outbounds":["dead","alive"],"url":"http://127.0.0.1:{}/","interval":3600}}"#,
                port
            ),
        ];
        let outbounds = configs
            .iter()
            .map(|json| {
                let options: OutboundOptions = serde_json::from_str(json).unwrap();
                new(&router, &OutboundRegistry::new(), &options).unwrap()
            })
            .collect();
        router.set_outbounds(outbounds).unwrap();

        let options: OutboundOptions = serde_json::from_str(&format!(
            r#"{{"type":"urltest","outbounds":["dead","alive"],"url":"http://127.0.0.1:{}/","interval":3600}}"#,
            port
        ))
        .unwrap();
        let urltest =
            UrlTestOutbound::new("probe".into(), Arc::downgrade(&router), &options, Span::none()).unwrap();
        urltest.start().unwrap();
        urltest.check().await.unwrap();

        assert_eq!(urltest.selected().unwrap().tag(), "alive");
        let delays = urltest.delays();
        assert!(delays.contains_key("alive"));
        assert!(!delays.contains_key("dead"));
        urltest.close().unwrap();
    }

    #[tokio::test]
    async fn test_no_healthy_member_is_not_found() {
        let router = Router::from_config(&Config::default()).unwrap();
        let block: OutboundOptions = serde_json::from_str(r#"{"type":"block","tag":"dead"}"#).unwrap();
        router
            .set_outbounds(vec![new(&router, &OutboundRegistry::new(), &block).unwrap()])
            .unwrap();

        let options: OutboundOptions = serde_json::from_str(
            r#"{"type":"urltest","outbounds":["dead"],"url":"http://127.0.0.1:9/","interval":3600}"#,
        )
        .unwrap();
        let urltest =
            UrlTestOutbound::new("auto".into(), Arc::downgrade(&router), &options, Span::none()).unwrap();
        urltest.start().unwrap();
        urltest.check().await.unwrap();

        let err = urltest
            .dial(&Metadata::default().with_destination(Address::domain("example.com", 80)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::OutboundNotFound(tag) if tag == "auto"));
        urltest.close().unwrap();
    }
}
