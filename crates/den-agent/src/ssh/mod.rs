//! SSH server
//!
//! Serves the SSH wire protocol on the overlay. Authentication is
//! intentionally absent: the overlay already authenticated the peer, so the
//! host key is a fresh throwaway RSA key per process and clients are
//! expected to skip host-key verification.

mod forward;
mod handler;
mod sftp;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::MethodSet;
use russh_keys::key::{KeyPair, SignatureHash};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use den_core::overlay::BoxedStream;

use crate::command::CommandFactory;
use handler::ConnectionHandler;

/// Shared dependencies for every SSH connection handler.
pub(crate) struct SessionDeps {
    pub factory: Arc<CommandFactory>,
    pub temp_dir: PathBuf,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
}

pub struct SshServer {
    config: Arc<russh::server::Config>,
    deps: Arc<SessionDeps>,
}

impl SshServer {
    /// Configure the server and generate the host key. Key generation
    /// failure is fatal; the agent cannot serve SSH without one.
    pub fn new(
        factory: Arc<CommandFactory>,
        temp_dir: PathBuf,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let host_key = KeyPair::generate_rsa(2048, SignatureHash::SHA2_512)
            .context("generate ephemeral RSA host key")?;

        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.methods = MethodSet::NONE;
        config.auth_rejection_time = Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(Duration::ZERO);

        Ok(Self {
            config: Arc::new(config),
            deps: Arc::new(SessionDeps {
                factory,
                temp_dir,
                tracker,
                shutdown,
            }),
        })
    }

    /// Run the SSH protocol on an accepted overlay connection.
    pub fn handle_conn(&self, stream: BoxedStream) {
        let config = Arc::clone(&self.config);
        let deps = Arc::clone(&self.deps);
        let shutdown = self.deps.shutdown.clone();

        self.deps.tracker.spawn(async move {
            let handler = ConnectionHandler::new(deps);
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = async {
                    match russh::server::run_stream(config, stream, handler).await {
                        Ok(session) => {
                            if let Err(err) = session.await {
                                tracing::debug!(error = %err, "ssh connection ended");
                            }
                        }
                        Err(err) => tracing::debug!(error = %err, "ssh handshake failed"),
                    }
                } => {}
            }
        });
    }
}
