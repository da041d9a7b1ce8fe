//! Child-process invocation builder
//!
//! Processes raw command input with OpenSSH-like behavior: everything runs
//! through the user's login shell, an empty command means the shell itself,
//! and the environment is assembled in a fixed precedence order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use portable_pty::CommandBuilder;
use tokio::process::Command;

use den_core::error::CommandError;
use den_core::types::WorkspaceMetadata;
use den_core::util::{expand_env, user_home_dir};
use den_core::{shell, Slot};

/// A fully resolved child invocation: program, arguments, working directory,
/// and complete environment. Later `env` entries override earlier ones.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Invocation for a plain (non-PTY) child.
    pub fn tokio_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.current_dir(&self.dir);
        cmd.env_clear();
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Invocation for a PTY-hosted child.
    pub fn pty_command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        for arg in &self.args {
            cmd.arg(arg);
        }
        cmd.cwd(&self.dir);
        cmd.env_clear();
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Environment with override order applied, for inspection.
    pub fn resolved_env(&self) -> HashMap<String, String> {
        self.env.iter().cloned().collect()
    }
}

/// Builds child invocations against the current workspace metadata and
/// session token. Fails with [`CommandError::NotReady`] until the supervisor
/// has populated the metadata slot.
pub struct CommandFactory {
    metadata: Arc<Slot<WorkspaceMetadata>>,
    session_token: Arc<Slot<String>>,
    env_overrides: HashMap<String, String>,
}

impl CommandFactory {
    pub fn new(
        metadata: Arc<Slot<WorkspaceMetadata>>,
        session_token: Arc<Slot<String>>,
        env_overrides: HashMap<String, String>,
    ) -> Self {
        Self {
            metadata,
            session_token,
            env_overrides,
        }
    }

    pub fn metadata(&self) -> Option<Arc<WorkspaceMetadata>> {
        self.metadata.load()
    }

    /// Build the invocation for `raw_command`, empty meaning the user's
    /// login shell. `session_env` is the per-session environment requested
    /// by the client.
    pub fn create(
        &self,
        raw_command: &str,
        session_env: &[(String, String)],
    ) -> Result<CommandSpec, CommandError> {
        let username = whoami::username();
        let program = shell::get(&username);

        let metadata = self.metadata.load().ok_or(CommandError::NotReady)?;

        // OpenSSH runs every command through the user's shell; IDE backends
        // depend on that behavior.
        let args = if raw_command.is_empty() {
            if cfg!(windows) {
                vec![]
            } else {
                // A login shell picks up profile environment.
                vec!["-l".to_string()]
            }
        } else {
            let caller = if cfg!(windows) { "/c" } else { "-c" };
            vec![caller.to_string(), raw_command.to_string()]
        };

        let dir = if metadata.directory.is_empty() {
            user_home_dir().ok_or(CommandError::HomeDir)?
        } else {
            PathBuf::from(&metadata.directory)
        };

        let mut env: Vec<(String, String)> = std::env::vars().collect();
        env.extend(session_env.iter().cloned());

        let executable = std::env::current_exe()?;
        // Git on Windows resolves UNIX-style paths only.
        let unix_executable = executable.to_string_lossy().replace('\\', "/");

        let session_token = self
            .session_token
            .load()
            .map(|token| (*token).clone())
            .unwrap_or_default();

        env.push(("CODER".to_string(), "true".to_string()));
        env.push(("USER".to_string(), username));
        env.push((
            "GIT_SSH_COMMAND".to_string(),
            format!("{} gitssh --", unix_executable),
        ));
        env.push(("CODER_AGENT_TOKEN".to_string(), session_token));
        // The agent does its networking in-memory, so there are no real
        // addresses to report; SSH clients only require these to be present.
        env.push(("SSH_CLIENT".to_string(), "0.0.0.0 0 0".to_string()));
        env.push((
            "SSH_CONNECTION".to_string(),
            "0.0.0.0 0 0.0.0.0 0".to_string(),
        ));
        env.push((
            "VSCODE_PROXY_URI".to_string(),
            metadata.vscode_port_proxy_uri.clone(),
        ));
        env.push((
            "CS_DISABLE_GETTING_STARTED_OVERRIDE".to_string(),
            "true".to_string(),
        ));

        // Workspace-configured variables override ours. Values are expanded
        // so users can prepend to $PATH and similar.
        for (key, value) in &metadata.environment_variables {
            env.push((key.clone(), expand_env(value)));
        }

        // Agent-level overrides win over everything.
        for (key, value) in &self.env_overrides {
            env.push((key.clone(), value.clone()));
        }

        Ok(CommandSpec {
            program,
            args,
            dir,
            env,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory_with_metadata(metadata: WorkspaceMetadata) -> CommandFactory {
        let metadata_slot = Arc::new(Slot::new());
        metadata_slot.swap(metadata);
        let token_slot = Arc::new(Slot::new());
        token_slot.swap("test-token".to_string());
        CommandFactory::new(metadata_slot, token_slot, HashMap::new())
    }

    #[test]
    fn test_create_not_ready_without_metadata() {
        let factory = CommandFactory::new(
            Arc::new(Slot::new()),
            Arc::new(Slot::new()),
            HashMap::new(),
        );
        assert!(matches!(
            factory.create("", &[]),
            Err(CommandError::NotReady)
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_create_login_shell_shape() {
        let factory = factory_with_metadata(WorkspaceMetadata::default());
        let spec = factory.create("", &[]).unwrap();
        assert_eq!(spec.args, vec!["-l"]);
    }

    #[test]
    #[cfg(unix)]
    fn test_create_command_shape() {
        let factory = factory_with_metadata(WorkspaceMetadata::default());
        let spec = factory.create("echo hi", &[]).unwrap();
        assert_eq!(spec.args, vec!["-c", "echo hi"]);
    }

    #[test]
    fn test_create_uses_metadata_directory() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = WorkspaceMetadata {
            directory: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let factory = factory_with_metadata(metadata);
        let spec = factory.create("", &[]).unwrap();
        assert_eq!(spec.dir, dir.path());
    }

    #[test]
    fn test_create_injects_fixed_environment() {
        let metadata = WorkspaceMetadata {
            vscode_port_proxy_uri: "https://{{port}}.example.com".to_string(),
            ..Default::default()
        };
        let factory = factory_with_metadata(metadata);
        let env = factory.create("", &[]).unwrap().resolved_env();

        assert_eq!(env.get("CODER").map(String::as_str), Some("true"));
        assert_eq!(
            env.get("CODER_AGENT_TOKEN").map(String::as_str),
            Some("test-token")
        );
        assert_eq!(
            env.get("SSH_CONNECTION").map(String::as_str),
            Some("0.0.0.0 0 0.0.0.0 0")
        );
        assert_eq!(
            env.get("VSCODE_PROXY_URI").map(String::as_str),
            Some("https://{{port}}.example.com")
        );
        assert!(env
            .get("GIT_SSH_COMMAND")
            .is_some_and(|v| v.ends_with(" gitssh --")));
    }

    #[test]
    fn test_metadata_env_expands_and_overrides() {
        std::env::set_var("DEN_TEST_BASE_PATH", "/usr/bin");
        let metadata = WorkspaceMetadata {
            environment_variables: HashMap::from([(
                "PATH".to_string(),
                "/workspace/bin:$DEN_TEST_BASE_PATH".to_string(),
            )]),
            ..Default::default()
        };
        let factory = factory_with_metadata(metadata);
        let env = factory.create("", &[]).unwrap().resolved_env();
        assert_eq!(
            env.get("PATH").map(String::as_str),
            Some("/workspace/bin:/usr/bin")
        );
    }

    #[test]
    fn test_agent_overrides_win_over_session_env() {
        let metadata_slot = Arc::new(Slot::new());
        metadata_slot.swap(WorkspaceMetadata::default());
        let token_slot = Arc::new(Slot::new());
        token_slot.swap(String::new());
        let factory = CommandFactory::new(
            metadata_slot,
            token_slot,
            HashMap::from([("WINNER".to_string(), "agent".to_string())]),
        );

        let session_env = vec![("WINNER".to_string(), "session".to_string())];
        let env = factory.create("", &session_env).unwrap().resolved_env();
        assert_eq!(env.get("WINNER").map(String::as_str), Some("agent"));
    }
}
