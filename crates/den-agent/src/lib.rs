//! den-agent: the workspace agent core
//!
//! A long-lived daemon that joins an overlay mesh, authenticates to the
//! control plane, and serves interactive access to the workspace: SSH (with
//! SFTP, port forwarding, and agent forwarding), reconnecting PTY sessions,
//! speedtest, and traffic telemetry. The control plane and the overlay
//! transport are injected behind the traits in `den_core`.

mod apphealth;
pub mod backoff;
pub mod command;
mod gitauth;
mod listeners;
mod pty;
pub mod rpty;
pub mod ssh;
pub mod stats;
mod startup;
mod supervisor;
pub mod util;

use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use den_core::client::{ControlPlane, StatsCollector, TokenExchanger};
use den_core::overlay::{Overlay, OverlayFactory};
use den_core::types::WorkspaceMetadata;
use den_core::{AgentConfig, Slot};

use command::CommandFactory;
use rpty::ReconnectingPtyServer;
use ssh::SshServer;

/// Everything needed to start an agent. The config is file-loadable; the
/// collaborators come from the embedding binary.
pub struct AgentOptions {
    pub config: AgentConfig,
    pub client: Arc<dyn ControlPlane>,
    pub token_exchanger: Arc<dyn TokenExchanger>,
    pub overlay_factory: Arc<dyn OverlayFactory>,
}

/// Close-ordering state: the overlay pointer and the closed flag share one
/// mutex so no task can register the network after close begins.
pub(crate) struct CloseState {
    closed: bool,
    network: Option<Arc<dyn Overlay>>,
}

pub(crate) struct AgentInner {
    pub config: AgentConfig,
    pub client: Arc<dyn ControlPlane>,
    pub token_exchanger: Arc<dyn TokenExchanger>,
    pub overlay_factory: Arc<dyn OverlayFactory>,
    pub metadata: Arc<Slot<WorkspaceMetadata>>,
    pub session_token: Arc<Slot<String>>,
    pub factory: Arc<CommandFactory>,
    pub rpty: ReconnectingPtyServer,
    pub ssh: SshServer,
    pub close_state: StdMutex<CloseState>,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
}

impl AgentInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.close_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
    }

    pub(crate) fn current_network(&self) -> Option<Arc<dyn Overlay>> {
        self.close_state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .network
            .clone()
    }

    /// Snapshot callback handed to the control plane's reporting channel and
    /// the statistics endpoint.
    pub(crate) fn stats_collector(inner: &Arc<AgentInner>) -> StatsCollector {
        let weak = Arc::downgrade(inner);
        Arc::new(move || {
            weak.upgrade()
                .and_then(|inner| inner.current_network())
                .map(|network| stats::aggregate(network.extract_traffic_stats()))
                .unwrap_or_default()
        })
    }
}

/// The workspace agent. Spawns its supervisor on start and runs until
/// [`close`](Agent::close).
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    /// Start the agent: generate the SSH host key, spawn the supervisor run
    /// loop, and register the stats reporting channel. Host-key generation
    /// failure is fatal.
    pub async fn start(options: AgentOptions) -> Result<Agent> {
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let metadata = Arc::new(Slot::new());
        let session_token = Arc::new(Slot::new());
        let factory = Arc::new(CommandFactory::new(
            Arc::clone(&metadata),
            Arc::clone(&session_token),
            options.config.env.clone(),
        ));

        tracing::info!("generating host key");
        let ssh = SshServer::new(
            Arc::clone(&factory),
            options.config.temp_dir.clone(),
            tracker.clone(),
            shutdown.clone(),
        )?;
        let rpty = ReconnectingPtyServer::new(
            Arc::clone(&factory),
            options.config.reconnecting_pty_timeout,
            tracker.clone(),
            shutdown.clone(),
        );

        let inner = Arc::new(AgentInner {
            config: options.config,
            client: options.client,
            token_exchanger: options.token_exchanger,
            overlay_factory: options.overlay_factory,
            metadata,
            session_token,
            factory,
            rpty,
            ssh,
            close_state: StdMutex::new(CloseState {
                closed: false,
                network: None,
            }),
            tracker,
            shutdown,
        });

        inner.tracker.spawn(supervisor::run_loop(Arc::clone(&inner)));

        match inner
            .client
            .report_stats(AgentInner::stats_collector(&inner))
            .await
        {
            Ok(handle) => {
                let shutdown = inner.shutdown.clone();
                inner.tracker.spawn(async move {
                    shutdown.cancelled().await;
                    handle.close().await;
                });
            }
            // Reporting is not worth failing startup over.
            Err(err) => tracing::error!(error = %err, "report stats"),
        }

        Ok(Agent { inner })
    }

    /// Number of live reconnecting-PTY sessions.
    pub fn reconnecting_pty_count(&self) -> usize {
        self.inner.rpty.session_count()
    }

    /// Shut down: cancel every task, close the overlay, and wait for all
    /// spawned work to drain. A second call is a no-op.
    pub async fn close(&self) {
        {
            let mut state = self
                .inner
                .close_state
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.inner.shutdown.cancel();

        if let Some(network) = self.inner.current_network() {
            network.close().await;
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}
