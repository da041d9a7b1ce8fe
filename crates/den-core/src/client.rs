//! Control-plane client traits
//!
//! The HTTP client to the control plane lives outside this workspace; the
//! agent consumes it through these traits. Tests substitute in-memory fakes.

use async_trait::async_trait;
use std::sync::Arc;

use den_protocol::AgentStats;

use crate::error::ClientError;
use crate::types::{Node, PostAppHealthsRequest, WorkspaceMetadata};

/// Produces an [`AgentStats`] snapshot on demand; handed to the control
/// plane's reporting channel, which decides the cadence.
pub type StatsCollector = Arc<dyn Fn() -> AgentStats + Send + Sync>;

/// The control plane, as seen from inside a workspace.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Fetch the current workspace metadata.
    async fn fetch_metadata(&self) -> Result<WorkspaceMetadata, ClientError>;

    /// Open the long-lived coordinator stream used to exchange node
    /// descriptors with clients.
    async fn open_coordinator(&self) -> Result<Box<dyn Coordinator>, ClientError>;

    /// Register a stats collector. The returned handle keeps the reporting
    /// channel open until closed.
    async fn report_stats(&self, collect: StatsCollector)
        -> Result<Box<dyn StatsHandle>, ClientError>;

    /// Post app health transitions.
    async fn post_app_health(&self, req: PostAppHealthsRequest) -> Result<(), ClientError>;

    /// Report the agent's build version.
    async fn post_version(&self, version: &str) -> Result<(), ClientError>;
}

/// The coordinator rendezvous stream.
///
/// `recv` returning `Ok(None)` is a clean EOF: the control plane hung up and
/// the supervisor should reconnect without logging noise.
#[async_trait]
pub trait Coordinator: Send {
    /// Await the next remote node descriptor. Must be cancel-safe: the
    /// supervisor polls this inside a `select!`.
    async fn recv(&mut self) -> Result<Option<Node>, ClientError>;

    async fn send(&self, node: Node) -> Result<(), ClientError>;
}

/// Handle returned by [`ControlPlane::report_stats`]; closing it stops the
/// reporting channel.
#[async_trait]
pub trait StatsHandle: Send + Sync {
    async fn close(&self);
}

/// Exchanges the agent's credential for a fresh session token. Called at the
/// start of every supervisor iteration so instance-identity deployments can
/// rotate tokens.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self) -> Result<String, ClientError>;
}

/// Token exchanger for deployments with a static token.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenExchanger for StaticToken {
    async fn exchange(&self) -> Result<String, ClientError> {
        Ok(self.0.clone())
    }
}
