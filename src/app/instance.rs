//! Instance - builds the router, outbounds and inbounds from a `Config` and
//! drives their lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::metrics::{format_bytes, TRAFFIC_BYTES_DOWNLOADED, TRAFFIC_BYTES_UPLOADED};
use super::metrics_api::{bind_metrics, serve_metrics};
use crate::config::Config;
use crate::error::Result;
use crate::inbound::{self, InboundAdapter};
use crate::outbound::{self, OutboundRegistry};
use crate::route::Router;

pub struct Instance {
    router: Arc<Router>,
    inbounds: Vec<InboundAdapter>,
    metrics_listen: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_registry(config, &OutboundRegistry::new())
    }

    /// Like [`Instance::new`], with externally provided outbound protocols
    pub fn with_registry(config: &Config, registry: &OutboundRegistry) -> Result<Self> {
        config.validate()?;

        let router = Router::from_config(config)?;

        let outbounds = config
            .outbounds
            .iter()
            .enumerate()
            .map(|(i, options)| {
                outbound::new(&router, registry, options)
                    .map_err(|e| e.cause(format!("parse outbound[{}]", i)))
            })
            .collect::<Result<Vec<_>>>()?;
        router.set_outbounds(outbounds)?;

        let inbounds = config
            .inbounds
            .iter()
            .enumerate()
            .map(|(i, options)| {
                inbound::new(&router, options).map_err(|e| e.cause(format!("parse inbound[{}]", i)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            router,
            inbounds,
            metrics_listen: config.experimental.metrics_listen,
            shutdown: watch::channel(false).0,
            metrics_task: Mutex::new(None),
        })
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn inbounds(&self) -> &[InboundAdapter] {
        &self.inbounds
    }

    pub fn inbound(&self, tag: &str) -> Option<&InboundAdapter> {
        self.inbounds.iter().find(|inbound| inbound.tag() == tag)
    }

    /// Start the router, then every inbound; a failing inbound stops the
    /// ones already started
    pub async fn start(&self) -> Result<()> {
        self.router.start()?;

        for (i, inbound) in self.inbounds.iter().enumerate() {
            if let Err(e) = inbound.start() {
                for started in &self.inbounds[..i] {
                    let _ = started.close().await;
                }
                let _ = self.router.close();
                return Err(e.cause(format!("start inbound [{}]", inbound.tag())));
            }
        }

        if let Some(addr) = self.metrics_listen {
            let listener = bind_metrics(addr).await?;
            let task = tokio::spawn(serve_metrics(listener, self.shutdown.subscribe()));
            *self.metrics_task.lock() = Some(task);
        }

        info!("[app] flowgate v{} started", env!("CARGO_PKG_VERSION"));
        Ok(())
    }

    /// Close inbounds first so no new flows reach the router, then the router
    pub async fn close(&self) -> Result<()> {
        self.shutdown.send_replace(true);

        let mut first_error = None;
        for inbound in &self.inbounds {
            if let Err(e) = inbound.close().await {
                error!("[app] close inbound [{}]: {}", inbound.tag(), e);
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.router.close() {
            first_error.get_or_insert(e);
        }

        let task = self.metrics_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        info!(
            "[app] traffic up {}, down {}",
            format_bytes(TRAFFIC_BYTES_UPLOADED.get()),
            format_bytes(TRAFFIC_BYTES_DOWNLOADED.get())
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Start, wait for Ctrl+C, close
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        tokio::signal::ctrl_c().await?;
        info!("[app] shutting down...");

        self.close().await
    }
}
