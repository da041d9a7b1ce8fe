//! Core error types for the workspace agent

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the control-plane client
#[derive(Error, Debug)]
pub enum ClientError {
    /// A request to the control plane failed
    #[error("control plane request failed: {0}")]
    Request(String),

    /// Token exchange failed
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// I/O error on the coordinator stream
    #[error("coordinator stream: {0}")]
    Coordinator(#[from] std::io::Error),

    /// The control plane returned a response we could not parse
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors from building a child-process invocation
#[derive(Error, Debug)]
pub enum CommandError {
    /// Workspace metadata has not been fetched yet; the caller should treat
    /// the agent as not ready rather than failed.
    #[error("workspace metadata not yet fetched")]
    NotReady,

    /// No home directory could be determined for the current user
    #[error("resolve home directory")]
    HomeDir,

    /// The agent's own executable path could not be determined
    #[error("resolve agent executable: {0}")]
    Executable(#[from] std::io::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
