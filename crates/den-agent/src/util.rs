//! Connection and login-session utilities

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use den_core::util::user_home_dir;

/// Copy bytes in both directions between two streams until either direction
/// finishes or the scope is cancelled, then shut both down.
///
/// Used as the glue for agent-forwarding and port-forwarding channels.
pub async fn bicopy<A, B>(scope: CancellationToken, a: A, b: B)
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    tokio::select! {
        _ = scope.cancelled() => {}
        _ = tokio::io::copy(&mut a_read, &mut b_write) => {}
        _ = tokio::io::copy(&mut b_read, &mut a_write) => {}
    }

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
}

/// Whether a session should suppress the MOTD: always, except for a login
/// shell whose user has no `~/.hushlogin`.
pub fn is_quiet_login(raw_command: &str) -> bool {
    if !raw_command.is_empty() {
        return true;
    }
    let Some(home) = user_home_dir() else {
        // Can't look up .hushlogin; err on the side of showing the MOTD.
        return false;
    };
    home.join(".hushlogin").exists()
}

/// Read the message of the day from `path`, or an empty string if there is
/// none to show.
///
/// Each line is terminated with CRLF so it renders from column zero on a raw
/// terminal.
pub async fn read_motd(path: &str) -> std::io::Result<String> {
    if path.is_empty() {
        return Ok(String::new());
    }

    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        // A missing MOTD simply means there is nothing to show.
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err),
    };

    let mut out = String::with_capacity(contents.len() + 16);
    for line in contents.lines() {
        out.push_str(line);
        out.push_str("\r\n");
    }
    Ok(out)
}
