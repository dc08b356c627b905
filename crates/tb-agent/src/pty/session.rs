//! PTY session lifecycle
//!
//! Each session owns one pseudo-terminal (via `portable-pty`), the shell
//! child running inside it, a bounded output history and the fan-out of
//! live output to subscribers. Sessions are shared (`Arc`) between the
//! manager, the relay connection and the blocking reader task.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use tb_core::ProcessError;
use tb_protocol::PtyInfo;

/// Every session is created at this size. A shared PTY is sized once,
/// generously, instead of following any single viewer's window.
pub const PTY_COLS: u16 = 200;
pub const PTY_ROWS: u16 = 100;

/// Capacity of each subscriber's output channel
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Read buffer for the blocking PTY reader
const READ_BUFFER_SIZE: usize = 4096;

/// Bounded byte buffer that keeps the newest output
pub(crate) struct HistoryBuffer {
    buf: VecDeque<u8>,
    limit: usize,
}

impl HistoryBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            limit,
        }
    }

    /// Append a chunk, evicting the oldest bytes once over the limit
    pub(crate) fn push(&mut self, data: &[u8]) {
        if self.limit == 0 {
            return;
        }
        if data.len() >= self.limit {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.limit..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.limit);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    /// Contiguous copy of the buffered bytes
    pub(crate) fn snapshot(&self) -> Bytes {
        Bytes::from(self.buf.iter().copied().collect::<Vec<u8>>())
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

/// History and live subscribers behind a single lock, so an attach sees a
/// consistent cut: everything up to the snapshot is history, everything
/// after arrives on the channel.
struct OutputState {
    history: HistoryBuffer,
    subscribers: Vec<mpsc::Sender<Bytes>>,
}

/// Everything needed to spawn a session; assembled by the manager
pub(crate) struct SessionSpec {
    pub id: String,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_directory: PathBuf,
    pub history_limit: usize,
    pub remote_viewable: bool,
    pub remote_created: bool,
}

/// One live pseudo-terminal and the shell running inside it
pub struct PtySession {
    id: String,
    name: Mutex<String>,
    remote_created: bool,
    output: Mutex<OutputState>,
    visibility: watch::Sender<bool>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl PtySession {
    /// Open a PTY, spawn the shell inside it and start the reader task
    pub(crate) fn spawn(spec: SessionSpec) -> Result<Arc<Self>, ProcessError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::PtyAllocation(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.cwd(&spec.working_directory);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ProcessError::Spawn {
                command: spec.command.clone(),
                reason: e.to_string(),
            })?;
        // The master keeps the PTY open; the slave is only needed for the
        // spawn, and holding it would mask EOF when the child exits.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ProcessError::PtyAllocation(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ProcessError::PtyAllocation(e.to_string()))?;

        let (visibility, _) = watch::channel(spec.remote_viewable);
        let session = Arc::new(Self {
            id: spec.id,
            name: Mutex::new(spec.name),
            remote_created: spec.remote_created,
            output: Mutex::new(OutputState {
                history: HistoryBuffer::new(spec.history_limit),
                subscribers: Vec::new(),
            }),
            visibility,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        Arc::clone(&session).start_reader(reader);
        Ok(session)
    }

    /// Pump the PTY master on a blocking thread until EOF, error or close
    fn start_reader(self: Arc<Self>, mut reader: Box<dyn Read + Send>) {
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match reader.read(&mut buf) {
                    Ok(0) => {
                        tracing::debug!("PTY {} reader saw EOF", self.id);
                        break;
                    }
                    Ok(n) => self.push_output(&buf[..n]),
                    Err(e) => {
                        if !cancel.is_cancelled() {
                            tracing::debug!("PTY {} reader stopped: {}", self.id, e);
                        }
                        break;
                    }
                }
            }
        });
    }

    /// Record a chunk in history and fan it out to live subscribers.
    /// Called from the blocking reader thread.
    fn push_output(&self, data: &[u8]) {
        let chunk = Bytes::copy_from_slice(data);
        let mut output = self.output.blocking_lock();
        output.history.push(data);
        output.subscribers.retain(|tx| match tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Dropping output chunk for slow subscriber of PTY {}", self.id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Subscribe to live output and take a history snapshot in one step.
    /// The snapshot ends exactly where the subscription begins.
    pub async fn attach_output(&self) -> (Bytes, mpsc::Receiver<Bytes>) {
        let mut output = self.output.lock().await;
        let history = output.history.snapshot();
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        output.subscribers.push(tx);
        (history, rx)
    }

    /// Subscribe to live output without the history snapshot
    pub async fn subscribe_output(&self) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        self.output.lock().await.subscribers.push(tx);
        rx
    }

    /// Copy of the buffered output
    pub async fn history_snapshot(&self) -> Bytes {
        self.output.lock().await.history.snapshot()
    }

    pub fn is_remote_viewable(&self) -> bool {
        *self.visibility.borrow()
    }

    /// Receiver that fires on every visibility transition
    pub fn watch_visibility(&self) -> watch::Receiver<bool> {
        self.visibility.subscribe()
    }

    /// Share or unshare this session. Watchers are only notified on an
    /// actual transition; returns whether the value changed.
    pub fn set_remote_viewable(&self, visible: bool) -> bool {
        self.visibility.send_if_modified(|current| {
            if *current == visible {
                false
            } else {
                *current = visible;
                true
            }
        })
    }

    /// Write input to the PTY. Writes are serialized.
    pub async fn write(&self, data: &[u8]) -> Result<(), ProcessError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProcessError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| ProcessError::Write(e.to_string()))?;
        writer.flush().map_err(|e| ProcessError::Write(e.to_string()))
    }

    /// Resize the live process. Both axes clamp to at least one cell.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), ProcessError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProcessError::Closed);
        }
        self.master
            .lock()
            .await
            .resize(PtySize {
                rows: rows.max(1),
                cols: cols.max(1),
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::Resize(e.to_string()))
    }

    /// Whether the child process is still running
    pub async fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.child.lock().await.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => false,
        }
    }

    /// Stop the reader, kill the child and drop all subscribers. Calling
    /// close again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        {
            let mut child = self.child.lock().await;
            if let Err(e) = child.kill() {
                tracing::debug!("PTY {} kill: {}", self.id, e);
            }
            let _ = child.wait();
        }
        self.output.lock().await.subscribers.clear();
        tracing::info!("Closed PTY {}", self.id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn name(&self) -> String {
        self.name.lock().await.clone()
    }

    pub async fn rename(&self, name: impl Into<String>) {
        *self.name.lock().await = name.into();
    }

    /// Whether the session was created on behalf of the relay
    pub fn remote_created(&self) -> bool {
        self.remote_created
    }

    /// Snapshot of this session as reported to the relay
    pub async fn info(&self) -> PtyInfo {
        PtyInfo {
            id: self.id.clone(),
            name: self.name().await,
            alive: self.is_alive().await,
            remote_viewable: self.is_remote_viewable(),
            remote_created: self.remote_created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_keeps_newest_bytes() {
        let mut history = HistoryBuffer::new(8);
        history.push(b"abcd");
        history.push(b"efgh");
        assert_eq!(history.snapshot().as_ref(), b"abcdefgh");

        history.push(b"ij");
        assert_eq!(history.snapshot().as_ref(), b"cdefghij");
        assert_eq!(history.len(), 8);
    }

    #[test]
    fn test_history_oversized_chunk_keeps_tail() {
        let mut history = HistoryBuffer::new(4);
        history.push(b"0123456789");
        assert_eq!(history.snapshot().as_ref(), b"6789");
    }

    #[test]
    fn test_history_zero_limit_stores_nothing() {
        let mut history = HistoryBuffer::new(0);
        history.push(b"data");
        assert_eq!(history.len(), 0);
        assert!(history.snapshot().is_empty());
    }

    #[cfg(unix)]
    fn test_spec(name: &str) -> SessionSpec {
        SessionSpec {
            id: format!("test-{}", name),
            name: name.to_string(),
            command: "/bin/sh".to_string(),
            // Deterministic first output, then hold the PTY open
            args: vec!["-c".to_string(), "printf ready && cat".to_string()],
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            working_directory: std::env::temp_dir(),
            history_limit: 100 * 1024,
            remote_viewable: false,
            remote_created: false,
        }
    }

    #[cfg(unix)]
    async fn wait_for_history(session: &PtySession, needle: &[u8]) -> Bytes {
        for _ in 0..100 {
            let snapshot = session.history_snapshot().await;
            if snapshot.windows(needle.len()).any(|w| w == needle) {
                return snapshot;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        panic!("Timed out waiting for PTY output");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_session_records_output_history() {
        let session = PtySession::spawn(test_spec("history")).unwrap();
        wait_for_history(&session, b"ready").await;
        session.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_attach_sees_history_then_live_output() {
        let session = PtySession::spawn(test_spec("attach")).unwrap();
        wait_for_history(&session, b"ready").await;

        let (history, mut output) = session.attach_output().await;
        assert!(history.windows(5).any(|w| w == b"ready"));

        session.write(b"ping\n").await.unwrap();
        let mut seen: Vec<u8> = Vec::new();
        let waited = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !seen.windows(4).any(|w| w == b"ping") {
                match output.recv().await {
                    Some(chunk) => seen.extend_from_slice(&chunk),
                    None => break,
                }
            }
        })
        .await;
        assert!(waited.is_ok(), "Timed out waiting for live output");
        session.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_visibility_fires_only_on_transitions() {
        let session = PtySession::spawn(test_spec("visibility")).unwrap();
        let mut watcher = session.watch_visibility();
        assert!(!session.is_remote_viewable());

        assert!(session.set_remote_viewable(true));
        assert!(!session.set_remote_viewable(true));
        watcher.changed().await.unwrap();
        assert!(*watcher.borrow_and_update());

        assert!(session.set_remote_viewable(false));
        watcher.changed().await.unwrap();
        assert!(!*watcher.borrow_and_update());
        session.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resize_clamps_to_one_cell() {
        let session = PtySession::spawn(test_spec("resize")).unwrap();
        session.resize(0, 0).await.unwrap();
        session.resize(120, 40).await.unwrap();
        session.close().await;
        assert!(session.resize(80, 24).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = PtySession::spawn(test_spec("close")).unwrap();
        assert!(session.is_alive().await);
        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert!(!session.is_alive().await);
        assert!(matches!(session.write(b"x").await, Err(ProcessError::Closed)));
    }
}
