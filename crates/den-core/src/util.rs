//! Small host utilities

use std::path::PathBuf;

/// Home directory of the current user, preferring `$HOME` so containerized
/// workspaces that override it behave like OpenSSH.
pub fn user_home_dir() -> Option<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return Some(PathBuf::from(home));
        }
    }
    dirs::home_dir()
}

/// Expand `$VAR` and `${VAR}` references against the process environment.
/// Unset variables expand to the empty string.
///
/// Metadata-provided values go through this so workspaces can prepend to
/// `PATH` and similar.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c2 in chars.by_ref() {
                    if c2 == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c2);
                }
                if closed {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    // Unterminated brace: emit literally.
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some(c2) if c2.is_ascii_alphanumeric() || *c2 == '_' => {
                let mut name = String::new();
                while let Some(c2) = chars.peek() {
                    if c2.is_ascii_alphanumeric() || *c2 == '_' {
                        name.push(*c2);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }

    out
}
