//! Overlay network traits
//!
//! The mesh transport (addressing, relays, WireGuard state) lives in an
//! external library; the agent only needs to bind listeners on well-known
//! overlay ports, keep the relay map fresh, exchange node descriptors, and
//! snapshot traffic counters. These traits are that seam.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;

use crate::types::{DerpMap, Node};

/// A byte stream accepted from (or dialed over) the overlay.
pub trait OverlayStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

impl<T> OverlayStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

/// Callback invoked whenever the local node descriptor changes.
pub type NodeCallback = Box<dyn Fn(Node) + Send + Sync>;

/// One end of an overlay connection, boxed for trait objects.
pub type BoxedStream = Box<dyn OverlayStream>;

/// Listener bound on an overlay port.
#[async_trait]
pub trait OverlayListener: Send + Sync {
    /// Accept the next inbound connection. An error means the listener is
    /// closed and the accept loop should end.
    async fn accept(&self) -> io::Result<BoxedStream>;
}

/// Identifies one tracked overlay connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub proto: Proto,
    pub src: String,
    pub dst: String,
}

/// Transport protocol of a tracked connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

/// Packet/byte counters for one connection since the last snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Options for standing up the mesh.
#[derive(Debug, Clone)]
pub struct OverlayOptions {
    pub derp_map: DerpMap,
    pub enable_traffic_stats: bool,
}

/// Creates the overlay network. The agent calls this at most once per
/// process; later supervisor iterations only refresh the relay map on the
/// existing network.
#[async_trait]
pub trait OverlayFactory: Send + Sync {
    async fn create(&self, options: OverlayOptions) -> io::Result<std::sync::Arc<dyn Overlay>>;
}

/// The overlay mesh network.
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Bind a listener on the given overlay port.
    async fn listen(&self, port: u16) -> io::Result<Box<dyn OverlayListener>>;

    /// Replace the relay-server map.
    fn set_derp_map(&self, derp_map: DerpMap);

    /// Register the callback fired on local node updates. Replaces any
    /// previous callback.
    fn set_node_callback(&self, callback: NodeCallback);

    /// Feed remote node descriptors into the mesh.
    fn update_nodes(&self, nodes: Vec<Node>);

    /// Drain per-connection traffic counters accumulated since the last
    /// call.
    fn extract_traffic_stats(&self) -> HashMap<ConnectionKey, Counts>;

    /// Serve the overlay library's speedtest protocol on an accepted
    /// connection.
    async fn serve_speedtest(&self, stream: BoxedStream) -> io::Result<()>;

    /// Shut the mesh down, closing all listeners and streams.
    async fn close(&self);
}
