//! Multi-listener dispatcher
//!
//! Binds the agent's four well-known overlay ports and runs one accept loop
//! per listener. An accept error ends that loop; every spawned task joins
//! the agent-wide tracker so close can drain them.

use std::sync::Arc;

use anyhow::{Context, Result};

use den_core::overlay::Overlay;
use den_protocol::ports;

use crate::{stats, AgentInner};

pub(crate) async fn bind_listeners(
    inner: &Arc<AgentInner>,
    network: &Arc<dyn Overlay>,
) -> Result<()> {
    let ssh_listener = network
        .listen(ports::SSH_PORT)
        .await
        .context("listen on the ssh port")?;
    {
        let inner = Arc::clone(inner);
        inner.tracker.clone().spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = inner.shutdown.cancelled() => return,
                    accepted = ssh_listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(_) => return,
                    },
                };
                inner.ssh.handle_conn(conn);
            }
        });
    }

    let pty_listener = network
        .listen(ports::RECONNECTING_PTY_PORT)
        .await
        .context("listen for reconnecting pty")?;
    {
        let inner = Arc::clone(inner);
        inner.tracker.clone().spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = inner.shutdown.cancelled() => return,
                    accepted = pty_listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::debug!(error = %err, "accept pty failed");
                            return;
                        }
                    },
                };
                let inner = Arc::clone(&inner);
                inner.tracker.clone().spawn(async move {
                    inner.rpty.handle(conn).await;
                });
            }
        });
    }

    let speedtest_listener = network
        .listen(ports::SPEEDTEST_PORT)
        .await
        .context("listen for speedtest")?;
    {
        let inner = Arc::clone(inner);
        let network = Arc::clone(network);
        inner.tracker.clone().spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = inner.shutdown.cancelled() => return,
                    accepted = speedtest_listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::debug!(error = %err, "speedtest listener failed");
                            return;
                        }
                    },
                };
                let network = Arc::clone(&network);
                inner.tracker.spawn(async move {
                    if let Err(err) = network.serve_speedtest(conn).await {
                        tracing::debug!(error = %err, "serve speedtest conn");
                    }
                });
            }
        });
    }

    let statistics_listener = network
        .listen(ports::STATISTICS_PORT)
        .await
        .context("listen for statistics")?;
    inner.tracker.spawn(stats::serve_statistics(
        statistics_listener,
        AgentInner::stats_collector(inner),
        inner.shutdown.clone(),
        inner.tracker.clone(),
    ));

    Ok(())
}
