//! Core domain types shared with the control plane

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::config::duration_secs;

/// Relay-server configuration for the overlay network. The schema belongs to
/// the overlay library; the agent only passes it through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DerpMap(pub serde_json::Value);

/// A node descriptor exchanged over the coordinator stream. Opaque to the
/// agent; produced and consumed by the overlay library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node(pub serde_json::Value);

/// Health states reported for a workspace app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppHealth {
    Disabled,
    Initializing,
    Healthy,
    Unhealthy,
}

/// Healthcheck settings for a workspace app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Healthcheck {
    pub url: String,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    /// Consecutive failures before the app is reported unhealthy.
    pub threshold: u32,
}

/// An app exposed by the workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceApp {
    pub name: String,
    #[serde(default)]
    pub healthcheck: Option<Healthcheck>,
    pub health: AppHealth,
}

/// Health updates posted back to the control plane, keyed by app name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostAppHealthsRequest {
    pub healths: HashMap<String, AppHealth>,
}

/// Everything the control plane tells the agent about its workspace.
///
/// Fetched on every supervisor iteration and swapped into the metadata slot
/// atomically; handlers must tolerate it being absent before the first
/// successful iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    /// Working directory for child processes; empty means the user's home.
    pub directory: String,
    /// Environment variables, values subject to `$VAR` expansion.
    pub environment_variables: HashMap<String, String>,
    /// Message-of-the-day file shown at login-shell startup.
    pub motd_file: String,
    /// Script run once per process lifetime.
    pub startup_script: String,
    pub derp_map: DerpMap,
    pub apps: Vec<WorkspaceApp>,
    /// Number of git-auth integrations configured for this deployment.
    pub git_auth_configs: usize,
    pub vscode_port_proxy_uri: String,
}
