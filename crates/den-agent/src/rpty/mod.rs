//! Reconnecting-PTY engine
//!
//! A terminal session keyed by a client-chosen id that survives client
//! disconnects. All attaches with the same id share one PTY child; output is
//! mirrored into a fixed scrollback ring before fan-out, so a late
//! subscriber replays exactly the prefix of the stream it missed. Sessions
//! die on process exit or after the idle timeout passes with no subscriber
//! heartbeats.

mod ring;
mod timer;

pub use ring::ScrollbackRing;
pub use timer::IdleTimer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use den_core::overlay::BoxedStream;
use den_protocol::rpty::{read_init, JsonStream, ReconnectingPtyInit, ReconnectingPtyRequest};

use crate::command::CommandFactory;
use crate::pty::{self, PtyHandle};

/// Scrollback retained per session.
const SCROLLBACK_CAPACITY: usize = 64 * 1024;

type Subscriber = WriteHalf<BoxedStream>;

/// One live reconnecting-PTY session.
struct PtySession {
    id: String,
    pty: Arc<PtyHandle>,
    scrollback: RwLock<ScrollbackRing>,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    /// Session scope: cancelled by the idle timer, agent shutdown, or
    /// teardown. Cancelling kills the child.
    scope: CancellationToken,
    timer: IdleTimer,
    closed: AtomicBool,
}

impl PtySession {
    /// Tear the session down: cancel the scope, close every subscriber.
    /// Idempotent; callers remove the registry entry first.
    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.scope.cancel();
        let mut subscribers = self.subscribers.lock().await;
        for (_, mut sink) in subscribers.drain() {
            let _ = sink.shutdown().await;
        }
    }
}

/// Registry of live reconnecting-PTY sessions, one handler invocation per
/// accepted overlay connection.
pub struct ReconnectingPtyServer {
    factory: Arc<CommandFactory>,
    timeout: Duration,
    sessions: Arc<DashMap<String, Arc<PtySession>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ReconnectingPtyServer {
    pub fn new(
        factory: Arc<CommandFactory>,
        timeout: Duration,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            factory,
            timeout,
            sessions: Arc::new(DashMap::new()),
            tracker,
            shutdown,
        }
    }

    /// Number of live sessions, for tests and telemetry.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Serve one accepted connection: read the init frame, attach to (or
    /// create) the session, replay scrollback, then pump input frames until
    /// the client goes away. Errors end only this attach.
    pub async fn handle(&self, stream: BoxedStream) {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let init = match read_init(&mut reader).await {
            Ok(init) => init,
            Err(err) => {
                tracing::debug!(error = %err, "drop reconnecting pty conn with bad init frame");
                return;
            }
        };
        let connection_id = Uuid::new_v4();
        tracing::debug!(
            session_id = %init.id,
            connection_id = %connection_id,
            command = %init.command,
            "reconnecting pty attach",
        );

        let session = match self.sessions.entry(init.id.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => match self.spawn_session(&init) {
                Ok(session) => {
                    entry.insert(Arc::clone(&session));
                    session
                }
                Err(err) => {
                    tracing::error!(session_id = %init.id, error = %err, "start reconnecting pty");
                    return;
                }
            },
        };

        if let Err(err) = session.pty.resize(init.height, init.width) {
            // Not fatal; the client can retry via a resize frame.
            tracing::error!(session_id = %init.id, error = %err, "initial pty resize");
        }

        // Replay-then-subscribe: the ring's read lock is held until the
        // subscriber is installed. The output pump appends and fans out
        // under the write lock plus the subscribers lock as one critical
        // section, so a chunk is either in the snapshot or delivered live,
        // never both and never neither.
        {
            let scrollback = session.scrollback.read().await;
            if let Err(err) = writer.write_all(&scrollback.snapshot()).await {
                tracing::warn!(session_id = %init.id, error = %err, "replay scrollback");
                return;
            }
            let mut subscribers = session.subscribers.lock().await;
            if session.closed.load(Ordering::SeqCst) {
                let _ = writer.shutdown().await;
                return;
            }
            subscribers.insert(connection_id, writer);
        }
        session.timer.reset();

        // Heartbeat: keep the idle timer from firing while this subscriber
        // is attached.
        let attach_scope = session.scope.child_token();
        let _detach_guard = attach_scope.clone().drop_guard();
        {
            let session = Arc::clone(&session);
            let attach_scope = attach_scope.clone();
            let period = self.timeout / 2;
            self.tracker.spawn(async move {
                let mut heartbeat = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = attach_scope.cancelled() => return,
                        _ = heartbeat.tick() => session.timer.reset(),
                    }
                }
            });
        }

        let mut buf = [0u8; 4096];
        let mut frames = JsonStream::new();
        'attached: loop {
            let read = tokio::select! {
                _ = session.scope.cancelled() => break 'attached,
                read = reader.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => break 'attached,
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(session_id = %init.id, error = %err, "read pty request stream");
                    break 'attached;
                }
            };
            frames.extend(&buf[..n]);
            loop {
                let request: ReconnectingPtyRequest = match frames.next() {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(session_id = %init.id, error = %err, "decode pty request");
                        break 'attached;
                    }
                };
                if !request.data.is_empty()
                    && !session.pty.write(Bytes::from(request.data.into_bytes()))
                {
                    tracing::warn!(session_id = %init.id, "write to reconnecting pty");
                    break 'attached;
                }
                if request.height > 0 && request.width > 0 {
                    if let Err(err) = session.pty.resize(request.height, request.width) {
                        tracing::error!(session_id = %init.id, error = %err, "resize reconnecting pty");
                    }
                }
            }
        }

        // Detach only this subscriber; the session and its scrollback live
        // on until process exit or idle timeout.
        let mut subscribers = session.subscribers.lock().await;
        subscribers.remove(&connection_id);
    }

    /// Start the PTY child and the three session tasks: kill-on-cancel,
    /// reap-on-exit, and the output pump.
    fn spawn_session(&self, init: &ReconnectingPtyInit) -> Result<Arc<PtySession>> {
        let mut spec = self.factory.create(&init.command, &[])?;
        spec.env
            .push(("TERM".to_string(), "xterm-256color".to_string()));

        let rows = if init.height > 0 { init.height } else { 24 };
        let cols = if init.width > 0 { init.width } else { 80 };
        let started = pty::start(&spec, rows, cols)?;

        let scope = self.shutdown.child_token();
        let session = Arc::new(PtySession {
            id: init.id.clone(),
            pty: started.handle,
            scrollback: RwLock::new(ScrollbackRing::new(SCROLLBACK_CAPACITY)),
            subscribers: Mutex::new(HashMap::new()),
            scope: scope.clone(),
            timer: IdleTimer::spawn(self.timeout, scope.clone(), &self.tracker),
            closed: AtomicBool::new(false),
        });

        // Kill on cancel: context-bound command cancellation is not honored
        // everywhere, so the child is killed explicitly.
        {
            let session = Arc::clone(&session);
            self.tracker.spawn(async move {
                session.scope.cancelled().await;
                session.pty.kill();
            });
        }

        // Reap on exit: once the child is gone, close the entry (and with it
        // every subscriber). The output pump owns registry removal.
        {
            let session = Arc::clone(&session);
            let exit = started.exit;
            self.tracker.spawn(async move {
                let code = exit.await;
                tracing::debug!(session_id = %session.id, exit_code = ?code.ok().flatten(), "reconnecting pty exited");
                session.close().await;
            });
        }

        // Output pump: scrollback first, then fan-out. Both locks are held
        // across the pair so an attach snapshotting the ring cannot be
        // handed the same chunk again by the in-flight fan-out. Slow or
        // dead subscribers never stall the stream; their writes just fail.
        {
            let session = Arc::clone(&session);
            let sessions = Arc::clone(&self.sessions);
            let mut output = started.output;
            self.tracker.spawn(async move {
                while let Some(chunk) = output.recv().await {
                    let mut scrollback = session.scrollback.write().await;
                    scrollback.write(&chunk);
                    let mut subscribers = session.subscribers.lock().await;
                    for sink in subscribers.values_mut() {
                        let _ = sink.write_all(&chunk).await;
                    }
                }
                // Output ended: the PTY is gone or unreadable. Deregister
                // this session only; a successor under the same id (created
                // after an idle expiry) must not be clobbered.
                session.pty.kill();
                sessions.remove_if(&session.id, |_, existing| Arc::ptr_eq(existing, &session));
                session.close().await;
            });
        }

        Ok(session)
    }
}
