//! Git-auth editor configuration override
//!
//! When the deployment has git-auth integrations, VS Code's built-in git
//! credential prompts must be disabled so the `GIT_SSH_COMMAND`/askpass flow
//! provided by the agent handles authentication instead. This merges the
//! override keys into every VS Code remote installation found in the home
//! directory.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use den_core::util::user_home_dir;

/// Relative paths of VS Code remote machine settings.
const SETTINGS_PATHS: &[&str] = &[
    ".vscode-server/data/Machine/settings.json",
    ".vscode-remote/data/Machine/settings.json",
];

pub(crate) fn override_vscode_configs() -> Result<()> {
    let home = user_home_dir().context("resolve home directory")?;
    for relative in SETTINGS_PATHS {
        let path = home.join(relative);
        // Only touch installations that exist; don't conjure one up.
        let Some(install_root) = installation_root(&home, relative) else {
            continue;
        };
        if !install_root.exists() {
            continue;
        }
        merge_settings(&path)
            .with_context(|| format!("override settings at {}", path.display()))?;
    }
    Ok(())
}

fn installation_root(home: &Path, relative: &str) -> Option<std::path::PathBuf> {
    let first = Path::new(relative).components().next()?;
    Some(home.join(first))
}

fn merge_settings(path: &Path) -> Result<()> {
    let mut settings: Value = match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|_| json!({})),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => json!({}),
        Err(err) => return Err(err.into()),
    };

    let Some(map) = settings.as_object_mut() else {
        anyhow::bail!("settings file is not a JSON object");
    };
    map.insert("git.useIntegratedAskPass".to_string(), json!(false));
    map.insert("github.gitAuthentication".to_string(), json!(false));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_settings_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Machine/settings.json");
        merge_settings(&path).unwrap();

        let settings: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(settings["git.useIntegratedAskPass"], json!(false));
        assert_eq!(settings["github.gitAuthentication"], json!(false));
    }

    #[test]
    fn test_merge_settings_preserves_existing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"editor.fontSize": 14}"#).unwrap();

        merge_settings(&path).unwrap();

        let settings: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(settings["editor.fontSize"], json!(14));
        assert_eq!(settings["git.useIntegratedAskPass"], json!(false));
    }

    #[test]
    fn test_installation_root_is_first_component() {
        let root = installation_root(
            Path::new("/home/dev"),
            ".vscode-server/data/Machine/settings.json",
        )
        .unwrap();
        assert_eq!(root, Path::new("/home/dev/.vscode-server"));
    }
}
