//! toimitus runtime - a configured shipper in a few lines
//!
//! Provides [`run()`] for zero-boilerplate startup from `TOIMITUS_*`
//! environment variables, and [`Shipper`] for callers that want to inject
//! their own registry, codec or dialers.
//!
//! # Quick start
//!
//! ```ignore
//! use toimitus_runtime::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     toimitus_runtime::run(|sender| async move {
//!         sender.publish(Event::default().field("message", "hello")).await?;
//!         Ok(())
//!     }).await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod prelude;

use prometheus::Registry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use toimitus_core::{Codec, JsonCodec};
use toimitus_output::{
    BackoffClient, Batcher, ClientWorker, Config, Dialer, EventSender, FailoverClient, LogFormat,
    OutputMetrics, TcpDialer, WindowedClient, WorkQueue,
};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How long [`RunningShipper::shutdown`] waits for each task
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type DialerFactory = Arc<dyn Fn(&str) -> Arc<dyn Dialer> + Send + Sync>;

/// Run a shipper with default settings.
///
/// Loads configuration from environment variables, initialises tracing,
/// starts the output, hands the producer handle to `produce` and keeps
/// running until `produce` returns and Ctrl+C / SIGTERM arrives.
pub async fn run<F, Fut>(produce: F) -> anyhow::Result<()>
where
    F: FnOnce(EventSender) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let config = Config::from_env()?;
    init_tracing(&config);

    let shipper = Shipper::new(config).start()?;
    produce(shipper.sender()).await?;

    shutdown_signal().await;
    shipper.shutdown().await;
    Ok(())
}

/// Builder wiring configuration into workers and clients
pub struct Shipper {
    config: Config,
    registry: Registry,
    codec: Arc<dyn Codec>,
    dialers: Option<DialerFactory>,
}

impl Shipper {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            registry: Registry::new(),
            codec: Arc::new(JsonCodec::new()),
            dialers: None,
        }
    }

    /// Load configuration from `TOIMITUS_*` variables
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self::new(Config::from_env()?))
    }

    /// Register output metrics here instead of a private registry
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the JSON codec
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Open connections through `factory` instead of TCP
    pub fn dialers<F>(mut self, factory: F) -> Self
    where
        F: Fn(&str) -> Arc<dyn Dialer> + Send + Sync + 'static,
    {
        self.dialers = Some(Arc::new(factory));
        self
    }

    /// Spawn the batching worker and client workers
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(self) -> anyhow::Result<RunningShipper> {
        self.config.validate()?;
        let config = self.config;
        let metrics = Arc::new(OutputMetrics::new(&self.registry)?);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connect_timeout = config.connect_timeout;
        let dialers: DialerFactory = match self.dialers {
            Some(factory) => factory,
            None => Arc::new(move |addr: &str| -> Arc<dyn Dialer> {
                Arc::new(TcpDialer::new(addr).connect_timeout(connect_timeout))
            }),
        };

        let clients: Vec<BackoffClient<WindowedClient>> = config
            .hosts
            .iter()
            .map(|host| {
                let client = WindowedClient::new(
                    dialers(host),
                    Arc::clone(&self.codec),
                    config.client_config(),
                )
                .with_observer(metrics.clone());
                BackoffClient::new(client, config.backoff().interrupt_on(shutdown_rx.clone()))
            })
            .collect();

        let workers = if config.loadbalance { clients.len() } else { 1 };
        let (batches_tx, batches_rx) = mpsc::channel(workers);
        let (sender, batcher) = Batcher::new()
            .queue_hwm(config.queue_hwm)
            .bulk_max_size(config.bulk_max_size)
            .flush_interval(config.flush_interval)
            .build(batches_tx);
        let queue = WorkQueue::new(batches_rx, config.max_retries);

        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn(batcher.run(shutdown_rx.clone())));

        if config.loadbalance {
            for (id, client) in clients.into_iter().enumerate() {
                let worker = ClientWorker::new(id, client, Arc::clone(&queue));
                let shutdown = shutdown_rx.clone();
                tasks.push(tokio::spawn(async move {
                    worker.run(shutdown).await;
                }));
            }
        } else {
            let worker = ClientWorker::new(0, FailoverClient::new(clients), Arc::clone(&queue));
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                worker.run(shutdown).await;
            }));
        }

        info!(
            hosts = ?config.hosts,
            loadbalance = config.loadbalance,
            workers,
            bulk_max_size = config.bulk_max_size,
            "Shipper started"
        );

        Ok(RunningShipper {
            sender,
            shutdown: shutdown_tx,
            tasks,
            metrics,
            registry: self.registry,
        })
    }
}

/// Handle on a started shipper
pub struct RunningShipper {
    sender: EventSender,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    metrics: Arc<OutputMetrics>,
    registry: Registry,
}

impl RunningShipper {
    /// Producer handle; clone freely
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn metrics(&self) -> &OutputMetrics {
        &self.metrics
    }

    /// Registry holding the output metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Stop all workers; undelivered events fail their producers
    pub async fn shutdown(self) {
        info!("Shipper shutting down");
        let _ = self.shutdown.send(true);
        drop(self.sender);

        for task in self.tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "worker task failed during shutdown"),
                Err(_) => warn!("worker task did not stop in time"),
            }
        }
        info!("Shipper shutdown complete");
    }
}

/// Initialise the tracing subscriber based on config.
pub fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    // a subscriber may already be installed (tests, embedding apps)
    let result = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    if result.is_err() {
        warn!("tracing subscriber already installed");
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use toimitus_core::Event;
    use toimitus_output::testkit::{AckBehavior, MemoryDialer, MockReceiver};

    fn config(hosts: &[&str], loadbalance: bool) -> Config {
        Config {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            loadbalance,
            bulk_max_size: 10,
            flush_interval: Duration::from_millis(20),
            stall_timeout: Duration::ZERO,
            backoff_init: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
            ..Config::default()
        }
    }

    fn memory(
        receivers: Vec<(&'static str, MockReceiver)>,
    ) -> impl Fn(&str) -> Arc<dyn Dialer> + Send + Sync + 'static {
        move |addr: &str| {
            let receiver = receivers
                .iter()
                .find(|(name, _)| *name == addr)
                .map(|(_, r)| r.clone())
                .unwrap();
            Arc::new(MemoryDialer::with_addr(addr, receiver)) as Arc<dyn Dialer>
        }
    }

    #[tokio::test]
    async fn test_failover_shipper_delivers() {
        let receiver = MockReceiver::new(AckBehavior::AckAll);
        let shipper = Shipper::new(config(&["a:5044"], false))
            .dialers(memory(vec![("a:5044", receiver.clone())]))
            .start()
            .unwrap();

        let events = (0..25).map(|i| Event::default().field("n", i)).collect();
        shipper.sender().publish_bulk_confirmed(events).await.unwrap();

        assert_eq!(receiver.received().len(), 25);
        assert_eq!(shipper.metrics().snapshot().events_acked, 25);
        shipper.shutdown().await;
    }

    #[tokio::test]
    async fn test_loadbalance_uses_every_host() {
        let a = MockReceiver::new(AckBehavior::AckAll);
        let b = MockReceiver::new(AckBehavior::AckAll);
        let shipper = Shipper::new(config(&["a:5044", "b:5044"], true))
            .dialers(memory(vec![("a:5044", a.clone()), ("b:5044", b.clone())]))
            .start()
            .unwrap();

        let sender = shipper.sender();
        let mut pending = Vec::new();
        for chunk in 0..8 {
            let sender = sender.clone();
            pending.push(tokio::spawn(async move {
                let events = (0..10)
                    .map(|i| Event::default().field("n", chunk * 10 + i))
                    .collect();
                sender.publish_bulk_confirmed(events).await
            }));
        }
        for task in pending {
            task.await.unwrap().unwrap();
        }

        assert_eq!(a.received().len() + b.received().len(), 80);
        // each worker keeps its one connection
        assert!(a.connections() <= 1);
        assert!(b.connections() <= 1);
        shipper.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_is_injected() {
        let registry = Registry::new();
        let receiver = MockReceiver::new(AckBehavior::AckAll);
        let shipper = Shipper::new(config(&["a:5044"], false))
            .registry(registry.clone())
            .dialers(memory(vec![("a:5044", receiver)]))
            .start()
            .unwrap();

        shipper
            .sender()
            .publish_confirmed(Event::default())
            .await
            .unwrap();

        let text = toimitus_output::metrics::gather(&registry);
        assert!(text.contains("toimitus_events_acked_total 1"));
        shipper.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let result = Shipper::new(Config {
            hosts: Vec::new(),
            ..Config::default()
        })
        .start();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiting_producers() {
        let receiver = MockReceiver::new(AckBehavior::AckAll);
        receiver.set_refusing(true);
        let shipper = Shipper::new(config(&["a:5044"], false))
            .dialers(memory(vec![("a:5044", receiver)]))
            .start()
            .unwrap();

        let sender = shipper.sender();
        let waiting =
            tokio::spawn(async move { sender.publish_confirmed(Event::default()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shipper.shutdown().await;

        assert!(waiting.await.unwrap().is_err());
    }
}
