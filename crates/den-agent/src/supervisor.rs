//! Connection supervisor
//!
//! The run loop that keeps the agent attached to the control plane: token
//! exchange, metadata refresh, overlay lifecycle, and the coordinator
//! stream. It never returns an error to its caller; failures are logged and
//! retried with backoff until the agent closes. The overlay network is
//! created once and survives coordinator restarts, so live SSH and PTY
//! sessions ride out control-plane blips.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use den_core::overlay::{Overlay, OverlayOptions};
use den_core::types::DerpMap;

use crate::backoff::ExponentialBackoff;
use crate::listeners;
use crate::{apphealth, gitauth, startup, AgentInner};

pub(crate) async fn run_loop(inner: Arc<AgentInner>) {
    let mut backoff = ExponentialBackoff::supervisor();
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff.next_delay()) => {}
        }
        if inner.is_closed() {
            return;
        }
        tracing::info!("running loop");
        match run_once(&inner).await {
            // A clean coordinator EOF lands here: reconnect quietly.
            Ok(()) => {}
            Err(err) => {
                if inner.is_closed() || inner.shutdown.is_cancelled() {
                    return;
                }
                tracing::warn!(error = ?err, "run exited with error");
            }
        }
    }
}

/// One supervisor iteration, from token exchange to the coordinator stream
/// ending.
async fn run_once(inner: &Arc<AgentInner>) -> Result<()> {
    // Refreshing the token first lets instance-identity deployments rotate
    // credentials across reconnects.
    let token = inner
        .token_exchanger
        .exchange()
        .await
        .context("exchange token")?;
    inner.session_token.swap(token);

    inner
        .client
        .post_version(env!("CARGO_PKG_VERSION"))
        .await
        .context("update agent version")?;

    let metadata = inner.client.fetch_metadata().await.context("fetch metadata")?;
    tracing::info!("fetched metadata");
    let previous = inner.metadata.swap(metadata.clone());

    // The startup script only executes on the first fetch of the process
    // lifetime.
    if previous.is_none() {
        let factory = Arc::clone(&inner.factory);
        let temp_dir = inner.config.temp_dir.clone();
        let script = metadata.startup_script.clone();
        inner.tracker.spawn(async move {
            if let Err(err) = startup::run(factory, &temp_dir, &script).await {
                tracing::warn!(error = ?err, "startup script failed");
            }
        });
    }

    if metadata.git_auth_configs > 0 {
        gitauth::override_vscode_configs()
            .context("override vscode configuration for git auth")?;
    }

    // The app-health reporter is scoped to this iteration; the guard cancels
    // it when run_once returns.
    let reporter_scope = inner.shutdown.child_token();
    let _reporter_guard = reporter_scope.clone().drop_guard();
    inner.tracker.spawn(apphealth::run(
        reporter_scope.clone(),
        metadata.apps.clone(),
        Arc::clone(&inner.client),
        inner.tracker.clone(),
    ));

    let network = match inner.current_network() {
        Some(network) => {
            network.set_derp_map(metadata.derp_map.clone());
            network
        }
        None => {
            tracing::debug!("creating overlay network");
            let network = create_network(inner, metadata.derp_map.clone()).await?;
            listeners::bind_listeners(inner, &network).await?;
            network
        }
    };

    tracing::debug!("running coordinator");
    run_coordinator(inner, &network).await
}

/// Create the overlay and publish it under the close mutex, backing out if
/// the agent closed concurrently.
async fn create_network(inner: &Arc<AgentInner>, derp_map: DerpMap) -> Result<Arc<dyn Overlay>> {
    if inner.is_closed() {
        anyhow::bail!("agent is closed");
    }
    let network = inner
        .overlay_factory
        .create(OverlayOptions {
            derp_map,
            enable_traffic_stats: true,
        })
        .await
        .context("create overlay network")?;

    let raced_close = {
        let mut state = inner.close_state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            true
        } else {
            state.network = Some(Arc::clone(&network));
            false
        }
    };
    if raced_close {
        network.close().await;
        anyhow::bail!("agent is closed");
    }
    Ok(network)
}

/// Drive the coordinator stream: remote node updates feed the overlay, local
/// node updates flow back out. Returns `Ok` on clean EOF.
async fn run_coordinator(inner: &Arc<AgentInner>, network: &Arc<dyn Overlay>) -> Result<()> {
    let mut coordinator = inner
        .client
        .open_coordinator()
        .await
        .context("open coordinator stream")?;
    tracing::info!("connected to coordination server");

    let (node_tx, mut node_rx) = mpsc::unbounded_channel();
    network.set_node_callback(Box::new(move |node| {
        let _ = node_tx.send(node);
    }));

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return Ok(()),
            update = node_rx.recv() => {
                let Some(node) = update else { return Ok(()) };
                coordinator.send(node).await.context("send local node update")?;
            }
            inbound = coordinator.recv() => match inbound.context("read coordinator stream")? {
                Some(node) => network.update_nodes(vec![node]),
                None => {
                    tracing::debug!("coordinator stream closed");
                    return Ok(());
                }
            },
        }
    }
}
