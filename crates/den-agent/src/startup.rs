//! Startup script execution
//!
//! The workspace's startup script runs exactly once per process lifetime,
//! through the same shell invocation as any other command. Both stdout and
//! stderr append to a log file in the agent's temp directory.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::command::CommandFactory;

pub(crate) const STARTUP_SCRIPT_LOG: &str = "coder-startup-script.log";

pub(crate) async fn run(factory: Arc<CommandFactory>, temp_dir: &Path, script: &str) -> Result<()> {
    if script.is_empty() {
        return Ok(());
    }
    tracing::info!(script = %script, "running startup script");

    let log_path = temp_dir.join(STARTUP_SCRIPT_LOG);
    let mut options = std::fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let log = options
        .open(&log_path)
        .with_context(|| format!("open startup script log {}", log_path.display()))?;

    let spec = factory.create(script, &[]).context("create command")?;
    let mut cmd = spec.tokio_command();
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(log.try_clone().context("clone startup log handle")?);
    cmd.stderr(log);

    let status = cmd.status().await.context("run startup script")?;
    if !status.success() {
        anyhow::bail!("startup script exited with {}", status);
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use den_core::types::WorkspaceMetadata;
    use den_core::Slot;

    fn test_factory(dir: &Path) -> Arc<CommandFactory> {
        let metadata = Arc::new(Slot::new());
        metadata.swap(WorkspaceMetadata {
            directory: dir.to_string_lossy().into_owned(),
            ..Default::default()
        });
        let token = Arc::new(Slot::new());
        token.swap(String::new());
        Arc::new(CommandFactory::new(metadata, token, HashMap::new()))
    }

    #[tokio::test]
    async fn test_empty_script_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let factory = test_factory(dir.path());
        run(factory, dir.path(), "").await.unwrap();
        assert!(!dir.path().join(STARTUP_SCRIPT_LOG).exists());
    }

    #[tokio::test]
    async fn test_script_output_lands_in_log() {
        let dir = tempfile::tempdir().unwrap();
        let factory = test_factory(dir.path());
        run(factory, dir.path(), "echo out; echo err 1>&2")
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join(STARTUP_SCRIPT_LOG)).unwrap();
        assert!(log.contains("out"));
        assert!(log.contains("err"));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join(STARTUP_SCRIPT_LOG))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_failing_script_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let factory = test_factory(dir.path());
        let err = run(factory, dir.path(), "exit 3").await.unwrap_err();
        assert!(err.to_string().contains("startup script"));
    }
}
