//! Per-connection SSH handler
//!
//! Accepts `session` and `direct-tcpip` channels, serves shell/exec
//! sessions through the command factory, and honors port- and
//! agent-forwarding requests unconditionally (trust comes from the
//! overlay).

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use den_protocol::MAGIC_SESSION_ERROR_CODE;

use crate::command::CommandSpec;
use crate::pty::{self, PtyHandle};
use crate::util::{bicopy, is_quiet_login, read_motd};

use super::{forward, sftp, SessionDeps};

/// Requested terminal parameters, saved until the shell/exec request.
#[derive(Debug, Clone)]
struct PtyParams {
    term: String,
    rows: u16,
    cols: u16,
}

/// Where `data` packets for a channel go once a child is running.
enum StdinSink {
    Pty(Arc<PtyHandle>),
    Pipe(mpsc::UnboundedSender<Bytes>),
}

struct ChannelState {
    channel: Option<Channel<Msg>>,
    env: Vec<(String, String)>,
    pty: Option<PtyParams>,
    stdin: Option<StdinSink>,
    resize_tx: Option<mpsc::UnboundedSender<(u16, u16)>>,
    auth_sock: Option<std::path::PathBuf>,
    /// Scope for this channel's helper tasks (agent-forward listener).
    scope: CancellationToken,
}

impl ChannelState {
    fn new(channel: Channel<Msg>, scope: CancellationToken) -> Self {
        Self {
            channel: Some(channel),
            env: Vec::new(),
            pty: None,
            stdin: None,
            resize_tx: None,
            auth_sock: None,
            scope,
        }
    }
}

pub(crate) struct ConnectionHandler {
    deps: Arc<SessionDeps>,
    channels: HashMap<ChannelId, ChannelState>,
    /// Reverse TCP forwards by requested (address, port).
    forwards: HashMap<(String, u32), CancellationToken>,
}

impl ConnectionHandler {
    pub(crate) fn new(deps: Arc<SessionDeps>) -> Self {
        Self {
            deps,
            channels: HashMap::new(),
            forwards: HashMap::new(),
        }
    }

    fn cancel_all(&mut self) {
        for state in self.channels.values() {
            state.scope.cancel();
        }
        for scope in self.forwards.values() {
            scope.cancel();
        }
    }

    /// Report an agent-level session failure, distinct from any exit code
    /// the user's command could produce.
    fn exit_abnormal(&self, handle: Handle, channel_id: ChannelId) {
        self.deps.tracker.spawn(async move {
            let _ = handle
                .exit_status_request(channel_id, MAGIC_SESSION_ERROR_CODE)
                .await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
    }

    /// Serve a shell or exec request on `channel_id`.
    async fn start_session(&mut self, channel_id: ChannelId, raw: String, session: &mut Session) {
        session.channel_success(channel_id);
        let handle = session.handle();

        let (session_env, pty_params, auth_sock, scope) = match self.channels.get_mut(&channel_id) {
            Some(state) => {
                // Session I/O flows through the handler callbacks; the
                // channel object is only kept around for SFTP.
                drop(state.channel.take());
                (
                    state.env.clone(),
                    state.pty.clone(),
                    state.auth_sock.clone(),
                    state.scope.clone(),
                )
            }
            None => return,
        };

        let mut spec = match self.deps.factory.create(&raw, &session_env) {
            Ok(spec) => spec,
            Err(err) => {
                tracing::warn!(error = %err, "create ssh session command");
                self.exit_abnormal(handle, channel_id);
                return;
            }
        };
        if let Some(sock) = auth_sock {
            spec.env
                .push(("SSH_AUTH_SOCK".to_string(), sock.to_string_lossy().into_owned()));
        }

        match pty_params {
            Some(params) => {
                self.start_pty_session(channel_id, raw, spec, params, handle, scope)
                    .await
            }
            None => self.start_exec_session(channel_id, spec, handle, scope),
        }
    }

    async fn start_pty_session(
        &mut self,
        channel_id: ChannelId,
        raw: String,
        mut spec: CommandSpec,
        params: PtyParams,
        handle: Handle,
        scope: CancellationToken,
    ) {
        // Login shells greet with the MOTD unless the user opted out.
        if !is_quiet_login(&raw) {
            match self.deps.factory.metadata() {
                Some(metadata) => match read_motd(&metadata.motd_file).await {
                    Ok(motd) if !motd.is_empty() => {
                        let _ = handle
                            .data(channel_id, CryptoVec::from_slice(motd.as_bytes()))
                            .await;
                    }
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "show MOTD"),
                },
                None => tracing::warn!("metadata lookup failed, unable to show MOTD"),
            }
        }

        spec.env.push(("TERM".to_string(), params.term.clone()));

        let started = match pty::start(&spec, params.rows, params.cols) {
            Ok(started) => started,
            Err(err) => {
                tracing::warn!(error = %err, "start pty command");
                self.exit_abnormal(handle, channel_id);
                return;
            }
        };

        let (resize_tx, mut resize_rx) = mpsc::unbounded_channel::<(u16, u16)>();
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.stdin = Some(StdinSink::Pty(Arc::clone(&started.handle)));
            state.resize_tx = Some(resize_tx);
        }

        // The child must not outlive its channel or the agent.
        {
            let pty_handle = Arc::clone(&started.handle);
            self.deps.tracker.spawn(async move {
                scope.cancelled().await;
                pty_handle.kill();
            });
        }

        // Window-change events.
        {
            let pty_handle = Arc::clone(&started.handle);
            self.deps.tracker.spawn(async move {
                while let Some((rows, cols)) = resize_rx.recv().await {
                    if let Err(err) = pty_handle.resize(rows, cols) {
                        tracing::warn!(error = %err, "resize session tty");
                    }
                }
            });
        }

        // PTY output -> session.
        let output_task = {
            let handle = handle.clone();
            let mut output = started.output;
            self.deps.tracker.spawn(async move {
                while let Some(chunk) = output.recv().await {
                    if handle
                        .data(channel_id, CryptoVec::from_slice(&chunk))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        // Exit status, sent only after the output pump has drained. A
        // non-zero code is the command's own business and is surfaced
        // unchanged.
        {
            let exit = started.exit;
            self.deps.tracker.spawn(async move {
                let code = match exit.await {
                    Ok(Some(code)) => code,
                    // Wait failure, already logged at the source.
                    Ok(None) => MAGIC_SESSION_ERROR_CODE,
                    Err(err) => {
                        tracing::warn!(error = %err, "wait for pty command");
                        MAGIC_SESSION_ERROR_CODE
                    }
                };
                let _ = output_task.await;
                let _ = handle.exit_status_request(channel_id, code).await;
                let _ = handle.eof(channel_id).await;
                let _ = handle.close(channel_id).await;
            });
        }
    }

    fn start_exec_session(
        &mut self,
        channel_id: ChannelId,
        spec: CommandSpec,
        handle: Handle,
        scope: CancellationToken,
    ) {
        let mut cmd = spec.tokio_command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(error = %err, program = %spec.program, "start command");
                self.exit_abnormal(handle, channel_id);
                return;
            }
        };

        // Stdin must be an explicit pipe; wiring the session straight into
        // the child blocks some commands forever waiting on stdin.
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<Bytes>();
        if let Some(state) = self.channels.get_mut(&channel_id) {
            state.stdin = Some(StdinSink::Pipe(stdin_tx));
        }
        if let Some(mut stdin) = child.stdin.take() {
            self.deps.tracker.spawn(async move {
                while let Some(data) = stdin_rx.recv().await {
                    if stdin.write_all(&data).await.is_err() {
                        break;
                    }
                }
                let _ = stdin.shutdown().await;
            });
        }

        let mut io_tasks = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            let handle = handle.clone();
            io_tasks.push(self.deps.tracker.spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stdout.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if handle
                        .data(channel_id, CryptoVec::from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }

        if let Some(mut stderr) = child.stderr.take() {
            let handle = handle.clone();
            io_tasks.push(self.deps.tracker.spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if handle
                        .extended_data(channel_id, 1, CryptoVec::from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }

        self.deps.tracker.spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = scope.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status
                    .code()
                    .map(|code| code as u32)
                    .unwrap_or(MAGIC_SESSION_ERROR_CODE),
                Err(err) => {
                    tracing::warn!(error = %err, "wait for command");
                    MAGIC_SESSION_ERROR_CODE
                }
            };
            // Don't report status until stdout/stderr have drained.
            for task in io_tasks {
                let _ = task.await;
            }
            let _ = handle.exit_status_request(channel_id, code).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// The overlay authenticated the peer; SSH-level auth adds nothing.
    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let scope = self.deps.shutdown.child_token();
        self.channels
            .insert(channel.id(), ChannelState::new(channel, scope));
        Ok(true)
    }

    /// Local port forwarding, allowed for any destination.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            destination_host = host_to_connect,
            destination_port = port_to_connect,
            "local port forward",
        );
        let host = host_to_connect.to_string();
        let scope = self.deps.shutdown.child_token();
        self.deps.tracker.spawn(async move {
            match tokio::net::TcpStream::connect((host.as_str(), port_to_connect as u16)).await {
                Ok(tcp) => bicopy(scope, channel.into_stream(), tcp).await,
                Err(err) => {
                    tracing::debug!(error = %err, host = %host, port = port_to_connect, "direct-tcpip dial");
                }
            }
        });
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state
                .env
                .push((variable_name.to_string(), variable_value.to_string()));
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.pty = Some(PtyParams {
                term: term.to_string(),
                rows: row_height as u16,
                cols: col_width as u16,
            });
        }
        session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            if let Some(resize_tx) = &state.resize_tx {
                let _ = resize_tx.send((row_height as u16, col_width as u16));
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session(channel, String::new(), session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw = String::from_utf8_lossy(data).into_owned();
        self.start_session(channel, raw, session).await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(channel_id);
            return Ok(());
        }
        let Some(channel) = self
            .channels
            .get_mut(&channel_id)
            .and_then(|state| state.channel.take())
        else {
            session.channel_failure(channel_id);
            return Ok(());
        };
        session.channel_success(channel_id);
        let handle = session.handle();
        self.deps
            .tracker
            .spawn(sftp::serve(channel, handle, channel_id));
        Ok(())
    }

    async fn agent_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let handle = session.handle();
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(false);
        };
        match forward::spawn_agent_listener(&self.deps, handle, state.scope.clone()) {
            Ok(sock) => {
                state.auth_sock = Some(sock);
                Ok(true)
            }
            Err(err) => {
                tracing::warn!(error = %err, "create agent forward listener");
                Ok(false)
            }
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get(&channel) {
            match &state.stdin {
                Some(StdinSink::Pty(pty)) => {
                    let _ = pty.write(Bytes::copy_from_slice(data));
                }
                Some(StdinSink::Pipe(stdin_tx)) => {
                    let _ = stdin_tx.send(Bytes::copy_from_slice(data));
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            // Dropping a pipe sender closes the child's stdin.
            if matches!(state.stdin, Some(StdinSink::Pipe(_))) {
                state.stdin = None;
            }
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.remove(&channel) {
            state.scope.cancel();
        }
        Ok(())
    }

    /// Reverse port forwarding, allowed for any bind address.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(bind_host = address, bind_port = *port, "reverse port forward");
        // An empty bind address means "all interfaces" on the wire.
        let bind_host = if address.is_empty() { "0.0.0.0" } else { address };
        let listener = match tokio::net::TcpListener::bind((bind_host, *port as u16)).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::debug!(error = %err, "bind reverse forward listener");
                return Ok(false);
            }
        };
        if *port == 0 {
            if let Ok(local) = listener.local_addr() {
                *port = local.port() as u32;
            }
        }

        let scope = self.deps.shutdown.child_token();
        self.forwards
            .insert((address.to_string(), *port), scope.clone());

        let handle = session.handle();
        let address = address.to_string();
        let port = *port;
        let tracker = self.deps.tracker.clone();
        self.deps.tracker.spawn(async move {
            loop {
                let (tcp, peer) = tokio::select! {
                    _ = scope.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(_) => break,
                    },
                };
                let channel = match handle
                    .channel_open_forwarded_tcpip(
                        address.clone(),
                        port,
                        peer.ip().to_string(),
                        peer.port() as u32,
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(err) => {
                        tracing::debug!(error = %err, "open forwarded-tcpip channel");
                        continue;
                    }
                };
                tracker.spawn(bicopy(scope.child_token(), tcp, channel.into_stream()));
            }
        });
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Some(scope) = self.forwards.remove(&(address.to_string(), port)) {
            scope.cancel();
        }
        Ok(true)
    }
}

/// Connection teardown kills any children and forward listeners still bound
/// to it.
impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
