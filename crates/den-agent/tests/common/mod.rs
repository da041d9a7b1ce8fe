//! In-memory fakes for the agent's external collaborators.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use den_core::client::{
    ControlPlane, Coordinator, StatsCollector, StatsHandle, TokenExchanger,
};
use den_core::error::ClientError;
use den_core::overlay::{
    BoxedStream, ConnectionKey, Counts, NodeCallback, Overlay, OverlayFactory, OverlayListener,
    OverlayOptions,
};
use den_core::types::{DerpMap, Node, PostAppHealthsRequest, WorkspaceMetadata};

/// Control plane backed by in-process state.
pub struct FakeControlPlane {
    pub metadata: StdMutex<WorkspaceMetadata>,
    pub fetches: AtomicUsize,
    pub versions: StdMutex<Vec<String>>,
    pub app_health_posts: StdMutex<Vec<PostAppHealthsRequest>>,
    pub coordinator_opens: AtomicUsize,
    coordinator_streams: StdMutex<Vec<CancellationToken>>,
    pub stats_closed: Arc<AtomicBool>,
    pub stats_collector: StdMutex<Option<StatsCollector>>,
}

impl FakeControlPlane {
    pub fn new(metadata: WorkspaceMetadata) -> Arc<Self> {
        Arc::new(Self {
            metadata: StdMutex::new(metadata),
            fetches: AtomicUsize::new(0),
            versions: StdMutex::new(Vec::new()),
            app_health_posts: StdMutex::new(Vec::new()),
            coordinator_opens: AtomicUsize::new(0),
            coordinator_streams: StdMutex::new(Vec::new()),
            stats_closed: Arc::new(AtomicBool::new(false)),
            stats_collector: StdMutex::new(None),
        })
    }

    /// Terminate the most recent coordinator stream with a clean EOF.
    pub fn kill_coordinator(&self) {
        if let Some(stream) = self.coordinator_streams.lock().unwrap().last() {
            stream.cancel();
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn fetch_metadata(&self) -> Result<WorkspaceMetadata, ClientError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.metadata.lock().unwrap().clone())
    }

    async fn open_coordinator(&self) -> Result<Box<dyn Coordinator>, ClientError> {
        self.coordinator_opens.fetch_add(1, Ordering::SeqCst);
        let eof = CancellationToken::new();
        self.coordinator_streams.lock().unwrap().push(eof.clone());
        Ok(Box::new(FakeCoordinator { eof }))
    }

    async fn report_stats(
        &self,
        collect: StatsCollector,
    ) -> Result<Box<dyn StatsHandle>, ClientError> {
        *self.stats_collector.lock().unwrap() = Some(collect);
        Ok(Box::new(FakeStatsHandle {
            closed: Arc::clone(&self.stats_closed),
        }))
    }

    async fn post_app_health(&self, req: PostAppHealthsRequest) -> Result<(), ClientError> {
        self.app_health_posts.lock().unwrap().push(req);
        Ok(())
    }

    async fn post_version(&self, version: &str) -> Result<(), ClientError> {
        self.versions.lock().unwrap().push(version.to_string());
        Ok(())
    }
}

struct FakeCoordinator {
    eof: CancellationToken,
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn recv(&mut self) -> Result<Option<Node>, ClientError> {
        self.eof.cancelled().await;
        Ok(None)
    }

    async fn send(&self, _node: Node) -> Result<(), ClientError> {
        Ok(())
    }
}

struct FakeStatsHandle {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl StatsHandle for FakeStatsHandle {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Token exchanger that counts invocations.
pub struct CountingToken {
    pub exchanges: AtomicUsize,
}

impl CountingToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            exchanges: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenExchanger for CountingToken {
    async fn exchange(&self) -> Result<String, ClientError> {
        let n = self.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(format!("token-{}", n))
    }
}

/// Overlay network backed by in-memory duplex pipes.
pub struct InMemoryOverlay {
    listeners: StdMutex<HashMap<u16, mpsc::UnboundedSender<BoxedStream>>>,
    pub derp_updates: AtomicUsize,
    pub node_callback: StdMutex<Option<NodeCallback>>,
    pub nodes_seen: StdMutex<Vec<Node>>,
    pub traffic: StdMutex<HashMap<ConnectionKey, Counts>>,
    closed: CancellationToken,
}

impl InMemoryOverlay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: StdMutex::new(HashMap::new()),
            derp_updates: AtomicUsize::new(0),
            node_callback: StdMutex::new(None),
            nodes_seen: StdMutex::new(Vec::new()),
            traffic: StdMutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        })
    }

    /// Wait for the agent to bind `port`, then open a connection to it.
    pub async fn dial(&self, port: u16) -> DuplexStream {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let Some(tx) = self.listeners.lock().unwrap().get(&port) {
                let (client, server) = tokio::io::duplex(256 * 1024);
                tx.send(Box::new(server)).expect("listener accept loop gone");
                return client;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "port {} was never bound",
                port
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Overlay for InMemoryOverlay {
    async fn listen(&self, port: u16) -> io::Result<Box<dyn OverlayListener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().insert(port, tx);
        Ok(Box::new(InMemoryListener {
            rx: tokio::sync::Mutex::new(rx),
            closed: self.closed.clone(),
        }))
    }

    fn set_derp_map(&self, _derp_map: DerpMap) {
        self.derp_updates.fetch_add(1, Ordering::SeqCst);
    }

    fn set_node_callback(&self, callback: NodeCallback) {
        *self.node_callback.lock().unwrap() = Some(callback);
    }

    fn update_nodes(&self, nodes: Vec<Node>) {
        self.nodes_seen.lock().unwrap().extend(nodes);
    }

    fn extract_traffic_stats(&self) -> HashMap<ConnectionKey, Counts> {
        std::mem::take(&mut self.traffic.lock().unwrap())
    }

    async fn serve_speedtest(&self, mut stream: BoxedStream) -> io::Result<()> {
        // Sink whatever the client sends.
        tokio::io::copy(&mut stream, &mut tokio::io::sink()).await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

struct InMemoryListener {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BoxedStream>>,
    closed: CancellationToken,
}

#[async_trait]
impl OverlayListener for InMemoryListener {
    async fn accept(&self) -> io::Result<BoxedStream> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "overlay closed",
            )),
            stream = rx.recv() => stream.ok_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "listener dropped")
            }),
        }
    }
}

/// Factory recording every overlay it hands out.
pub struct InMemoryOverlayFactory {
    pub created: StdMutex<Vec<Arc<InMemoryOverlay>>>,
}

impl InMemoryOverlayFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            created: StdMutex::new(Vec::new()),
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn current(&self) -> Option<Arc<InMemoryOverlay>> {
        self.created.lock().unwrap().last().cloned()
    }

    /// Wait for the agent's supervisor to create the overlay.
    pub async fn wait_for_overlay(&self) -> Arc<InMemoryOverlay> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if let Some(overlay) = self.current() {
                return overlay;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "overlay was never created"
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl OverlayFactory for InMemoryOverlayFactory {
    async fn create(&self, _options: OverlayOptions) -> io::Result<Arc<dyn Overlay>> {
        let overlay = InMemoryOverlay::new();
        self.created.lock().unwrap().push(Arc::clone(&overlay));
        Ok(overlay)
    }
}

/// Route agent logs through the test harness when `RUST_LOG` asks for them.
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Poll until `predicate` holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
