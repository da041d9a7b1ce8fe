//! PTY-hosted child processes
//!
//! Bridges portable-pty's blocking I/O into the async world: a blocking
//! reader task feeds output chunks through a channel, a blocking writer task
//! drains input, and a blocking wait task reports the exit code. The child
//! can be killed from any task through a cloned killer.

use std::io::{Read, Write};
use std::sync::Mutex as StdMutex;

use anyhow::Result;
use bytes::Bytes;
use portable_pty::{native_pty_system, Child as _, ChildKiller, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};

use crate::command::CommandSpec;

/// Scratch-buffer size for the PTY output reader.
const OUTPUT_CHUNK_SIZE: usize = 1024;

/// Backpressure bound for output chunks in flight to the async side.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Handle to a running PTY child, shared between input, resize, and kill
/// paths.
pub struct PtyHandle {
    master: StdMutex<Box<dyn MasterPty + Send>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::UnboundedSender<Bytes>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Queue bytes for the child's stdin. Returns false once the writer has
    /// shut down.
    pub fn write(&self, data: Bytes) -> bool {
        self.input_tx.send(data).is_ok()
    }

    /// Resize the terminal.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow::anyhow!("resize pty: {}", e))
    }

    /// Kill the child process. Idempotent; errors from an already-dead child
    /// are ignored.
    pub fn kill(&self) {
        let mut killer = self.killer.lock().unwrap_or_else(|e| e.into_inner());
        let _ = killer.kill();
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// A freshly started PTY child: the shared handle, the output chunk stream,
/// and a receiver resolved with the exit code — `None` when the wait itself
/// failed, which callers report as an agent-level error rather than an exit
/// code.
pub struct StartedPty {
    pub handle: std::sync::Arc<PtyHandle>,
    pub output: mpsc::Receiver<Bytes>,
    pub exit: oneshot::Receiver<Option<u32>>,
}

/// Start `spec` inside a new PTY of the given size.
pub fn start(spec: &CommandSpec, rows: u16, cols: u16) -> Result<StartedPty> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| anyhow::anyhow!("open pty: {}", e))?;

    let mut child = pair
        .slave
        .spawn_command(spec.pty_command())
        .map_err(|e| anyhow::anyhow!("spawn {}: {}", spec.program, e))?;
    let killer = child.clone_killer();
    let pid = child.process_id();

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| anyhow::anyhow!("clone pty reader: {}", e))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| anyhow::anyhow!("take pty writer: {}", e))?;

    let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Bytes>();
    let (exit_tx, exit_rx) = oneshot::channel::<Option<u32>>();

    // Output pump: PTY master -> channel. Ends on EOF or read error, which
    // also signals the consumer that the stream is over.
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; OUTPUT_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if output_tx
                        .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    // Input pump: channel -> PTY master.
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    // Reaper: blocks until the child exits. A wait failure is not an exit
    // code and must not masquerade as one.
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => Some(status.exit_code()),
            Err(err) => {
                tracing::warn!(error = %err, "wait for pty child");
                None
            }
        };
        let _ = exit_tx.send(code);
    });

    Ok(StartedPty {
        handle: std::sync::Arc::new(PtyHandle {
            master: StdMutex::new(pair.master),
            killer: StdMutex::new(killer),
            input_tx,
            pid,
        }),
        output: output_rx,
        exit: exit_rx,
    })
}
