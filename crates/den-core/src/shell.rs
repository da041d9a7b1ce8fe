//! Login-shell discovery
//!
//! Resolves the shell that OpenSSH would start for a user: the passwd entry
//! on Unix, falling back to `$SHELL`, then `/bin/sh`.

/// Resolve the login shell for `username`.
#[cfg(unix)]
pub fn get(username: &str) -> String {
    if let Ok(passwd) = std::fs::read_to_string("/etc/passwd") {
        if let Some(shell) = from_passwd(&passwd, username) {
            return shell;
        }
    }
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }
    "/bin/sh".to_string()
}

#[cfg(windows)]
pub fn get(_username: &str) -> String {
    std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
}

/// Extract the shell field from passwd-format content.
#[cfg(unix)]
fn from_passwd(passwd: &str, username: &str) -> Option<String> {
    for line in passwd.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        if fields.next() != Some(username) {
            continue;
        }
        let shell = fields.nth(5)?.trim();
        if !shell.is_empty() {
            return Some(shell.to_string());
        }
    }
    None
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
dev:x:1000:1000:Dev User,,,:/home/dev:/usr/bin/zsh
";

    #[test]
    fn test_from_passwd_finds_user_shell() {
        assert_eq!(
            from_passwd(PASSWD, "dev").as_deref(),
            Some("/usr/bin/zsh")
        );
        assert_eq!(from_passwd(PASSWD, "root").as_deref(), Some("/bin/bash"));
    }

    #[test]
    fn test_from_passwd_unknown_user() {
        assert!(from_passwd(PASSWD, "nobody-here").is_none());
    }

    #[test]
    fn test_from_passwd_ignores_prefix_matches() {
        // "roo" must not match the "root" entry.
        assert!(from_passwd(PASSWD, "roo").is_none());
    }

    #[test]
    fn test_get_always_resolves_a_shell() {
        // Even a user absent from passwd lands on $SHELL or /bin/sh.
        let shell = get("no-such-user-here");
        assert!(!shell.is_empty());
    }
}
