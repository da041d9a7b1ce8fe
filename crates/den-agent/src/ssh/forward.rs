//! SSH agent forwarding
//!
//! When a client requests agent forwarding, the agent listens on a Unix
//! socket inside its temp directory and bridges every connection back to
//! the client as an `auth-agent@openssh.com` channel. The socket path is
//! exported to the child as `SSH_AUTH_SOCK`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh::server::Handle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::util::bicopy;

use super::SessionDeps;

/// Bind the forwarded-agent socket and start bridging connections. Returns
/// the socket path; the listener lives until `scope` is cancelled.
#[cfg(unix)]
pub(crate) fn spawn_agent_listener(
    deps: &Arc<SessionDeps>,
    handle: Handle,
    scope: CancellationToken,
) -> Result<PathBuf> {
    let path = deps
        .temp_dir
        .join(format!("den-agent-auth-{}.sock", Uuid::new_v4()));
    let listener = tokio::net::UnixListener::bind(&path)
        .with_context(|| format!("bind agent socket at {}", path.display()))?;

    let tracker = deps.tracker.clone();
    let socket_path = path.clone();
    deps.tracker.spawn(async move {
        loop {
            let conn = tokio::select! {
                _ = scope.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((conn, _)) => conn,
                    Err(_) => break,
                },
            };
            let channel = match handle.channel_open_agent().await {
                Ok(channel) => channel,
                Err(err) => {
                    tracing::debug!(error = %err, "open auth-agent channel");
                    break;
                }
            };
            tracker.spawn(bicopy(scope.child_token(), conn, channel.into_stream()));
        }
        let _ = std::fs::remove_file(&socket_path);
    });

    Ok(path)
}

#[cfg(not(unix))]
pub(crate) fn spawn_agent_listener(
    _deps: &Arc<SessionDeps>,
    _handle: Handle,
    _scope: CancellationToken,
) -> Result<PathBuf> {
    anyhow::bail!("agent forwarding requires unix sockets")
}
