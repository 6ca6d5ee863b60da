//! Session management
//!
//! A [`Session`] owns one child process running on a PTY. A background
//! reader pulls the child's output, answers capability queries through the
//! [`QueryInterceptor`], and feeds everything else to the
//! [`VirtualScreen`]. Callers observe the screen through [`Session::snapshot`].

use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
#[cfg(unix)]
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use portable_pty::{Child, ChildKiller, ExitStatus, MasterPty};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::pty::{self, Pty, PtyError, SpawnSpec};
use super::query::{QueryInterceptor, TermSize};
use super::term::VirtualScreen;
use super::wait::{SnapshotSource, TimeoutKind};

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_TERM: &str = "xterm-256color";

const READ_BUFFER_SIZE: usize = 4096;

/// How long the reader waits for output before flushing carried bytes
/// and rechecking the stop flag
#[cfg(unix)]
const IDLE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid {dimension}: {value} (must be at most {})", u16::MAX)]
    InvalidSize { dimension: &'static str, value: usize },

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("failed to read from pty: {0}")]
    Read(#[source] Arc<io::Error>),

    #[error("failed to write to pty: {0}")]
    Write(#[source] io::Error),

    #[error("failed to start pty reader thread: {0}")]
    SpawnReader(#[source] io::Error),

    #[error("timeout: {0}")]
    Timeout(TimeoutKind),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Size and environment for a new session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// 0 means [`DEFAULT_ROWS`]
    pub rows: usize,
    /// 0 means [`DEFAULT_COLS`]
    pub cols: usize,
    /// `KEY=VALUE` entries added to the child's environment
    pub env: Vec<String>,
    pub term: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS as usize,
            cols: DEFAULT_COLS as usize,
            env: Vec::new(),
            term: DEFAULT_TERM.to_string(),
        }
    }
}

/// Immutable rendering of the screen at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenSnapshot {
    pub text: String,
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub cursor_visible: bool,
    pub rows: u16,
    pub cols: u16,
}

/// Everything the session lock guards
struct Screen {
    rows: u16,
    cols: u16,
    model: VirtualScreen,
}

impl Screen {
    fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            model: VirtualScreen::new(cols, rows),
        }
    }

    fn size(&self) -> TermSize {
        TermSize {
            rows: self.rows,
            cols: self.cols,
        }
    }
}

type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// Writes into the PTY until the session closes it
struct PtyWriter(SharedWriter);

impl Write for PtyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock().as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(closed_pty()),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.0.lock().as_mut() {
            Some(writer) => writer.write_all(buf),
            None => Err(closed_pty()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock().as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

fn closed_pty() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "pty is closed")
}

/// One-shot "reader loop finished" signal
#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn signal(&self) {
        let mut done = self.done.lock();
        if !*done {
            *done = true;
            self.cond.notify_all();
        }
    }

    fn is_done(&self) -> bool {
        *self.done.lock()
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

/// Signals completion when the reader thread exits, including by panic
struct SignalOnDrop(Arc<Completion>);

impl Drop for SignalOnDrop {
    fn drop(&mut self) {
        self.0.signal();
    }
}

/// What the reader should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    /// Output is waiting, or readiness cannot be observed
    Ready,
    /// Nothing arrived within the idle interval
    Idle,
    /// The session is closing
    Stop,
}

/// Lets `close()` stop a reader whose PTY never reaches end-of-stream
struct ReadGate {
    stop: Arc<AtomicBool>,
    #[cfg(unix)]
    fd: Option<RawFd>,
}

impl ReadGate {
    fn wait(&self) -> Readiness {
        if self.stop.load(Ordering::SeqCst) {
            return Readiness::Stop;
        }
        #[cfg(unix)]
        if let Some(fd) = self.fd {
            return match pty::poll_readable(fd, IDLE_INTERVAL) {
                Ok(true) => Readiness::Ready,
                Ok(false) if self.stop.load(Ordering::SeqCst) => Readiness::Stop,
                Ok(false) => Readiness::Idle,
                Err(err) => {
                    debug!(error = %err, "poll failed, falling back to blocking reads");
                    Readiness::Ready
                }
            };
        }
        Readiness::Ready
    }
}

/// A child process attached to a PTY
pub struct Session {
    command: String,
    pid: Option<u32>,
    screen: Arc<Mutex<Screen>>,
    writer: SharedWriter,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit_status: Mutex<Option<ExitStatus>>,
    completion: Arc<Completion>,
    last_error: Arc<Mutex<Option<Arc<io::Error>>>>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl Session {
    /// Spawn `command` on a new PTY and start the reader
    pub fn new(command: &str, args: &[String], options: &SessionOptions) -> Result<Self> {
        let rows = match validate_size("rows", options.rows)? {
            0 => DEFAULT_ROWS,
            rows => rows,
        };
        let cols = match validate_size("cols", options.cols)? {
            0 => DEFAULT_COLS,
            cols => cols,
        };

        let env = options
            .env
            .iter()
            .filter_map(|entry| {
                let pair = pty::parse_env_pair(entry);
                if pair.is_none() {
                    warn!(entry = %entry, "ignoring malformed environment entry");
                }
                pair
            })
            .collect();

        let spec = SpawnSpec {
            command: command.to_string(),
            args: args.to_vec(),
            env,
            term: options.term.clone(),
            rows,
            cols,
        };
        let Pty {
            master,
            child,
            reader,
            writer,
        } = Pty::spawn(&spec)?;

        let pid = child.process_id();
        let mut killer = child.clone_killer();
        let screen = Arc::new(Mutex::new(Screen::new(cols, rows)));
        let writer: SharedWriter = Arc::new(Mutex::new(Some(writer)));
        let completion = Arc::new(Completion::default());
        let last_error = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let reader_thread = {
            let gate = ReadGate {
                stop: Arc::clone(&stop),
                #[cfg(unix)]
                fd: master.as_raw_fd(),
            };
            let screen = Arc::clone(&screen);
            let responder = PtyWriter(Arc::clone(&writer));
            let signal = SignalOnDrop(Arc::clone(&completion));
            let last_error = Arc::clone(&last_error);
            let spawned = thread::Builder::new()
                .name("ptyshot-reader".to_string())
                .spawn(move || {
                    read_loop(reader, || gate.wait(), screen, responder, last_error, signal)
                });
            match spawned {
                Ok(handle) => handle,
                Err(err) => {
                    let _ = killer.kill();
                    return Err(SessionError::SpawnReader(err));
                }
            }
        };

        info!(command, ?pid, rows, cols, "session started");

        Ok(Self {
            command: command.to_string(),
            pid,
            screen,
            writer,
            master: Mutex::new(Some(master)),
            child: Mutex::new(child),
            killer: Mutex::new(killer),
            exit_status: Mutex::new(None),
            completion,
            last_error,
            reader_thread: Mutex::new(Some(reader_thread)),
            stop,
            closed: AtomicBool::new(false),
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current screen text and cursor state
    pub fn snapshot(&self) -> ScreenSnapshot {
        let screen = self.screen.lock();
        let (cursor_row, cursor_col, cursor_visible) = screen.model.cursor();
        ScreenSnapshot {
            text: screen.model.render_text(),
            cursor_row,
            cursor_col,
            cursor_visible,
            rows: screen.rows,
            cols: screen.cols,
        }
    }

    /// Last window title set by the child
    pub fn title(&self) -> String {
        self.screen.lock().model.title().to_string()
    }

    /// Write raw bytes to the child's input
    pub fn send_keys(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let writer = writer
            .as_mut()
            .ok_or_else(|| SessionError::Write(closed_pty()))?;
        writer
            .write_all(bytes)
            .and_then(|()| writer.flush())
            .map_err(SessionError::Write)
    }

    /// Resize the PTY and start over with a blank screen of the new size
    pub fn resize(&self, cols: usize, rows: usize) -> Result<()> {
        let cols = validate_size("cols", cols)?;
        let rows = validate_size("rows", rows)?;

        {
            let master = self.master.lock();
            let master = master.as_ref().ok_or_else(|| SessionError::Write(closed_pty()))?;
            pty::resize(&**master, cols, rows)?;
        }

        *self.screen.lock() = Screen::new(cols, rows);
        debug!(rows, cols, "session resized");
        Ok(())
    }

    /// (cols, rows) as last requested
    pub fn size(&self) -> (u16, u16) {
        let screen = self.screen.lock();
        (screen.cols, screen.rows)
    }

    /// True until the reader loop has finished
    pub fn is_running(&self) -> bool {
        !self.completion.is_done()
    }

    /// Exit status if the child has already exited; never blocks
    pub fn exit_status(&self) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status.lock().clone() {
            return Some(status);
        }
        // Held by a concurrent wait(), so the child has not been reaped yet
        let mut child = self.child.try_lock()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                *self.exit_status.lock() = Some(status.clone());
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                debug!(error = %err, "try_wait failed");
                None
            }
        }
    }

    /// Block until the output is drained and the child is reaped
    pub fn wait(&self) -> Result<ExitStatus> {
        self.completion.wait();

        let cached = self.exit_status.lock().clone();
        let status = match cached {
            Some(status) => status,
            None => {
                let status = self
                    .child
                    .lock()
                    .wait()
                    .map_err(|err| SessionError::Pty(PtyError::Wait(err)))?;
                *self.exit_status.lock() = Some(status.clone());
                status
            }
        };

        match self.last_error() {
            Some(err) => Err(SessionError::Read(err)),
            None => Ok(status),
        }
    }

    /// Error that ended the reader loop, if any
    pub fn last_error(&self) -> Option<Arc<io::Error>> {
        self.last_error.lock().clone()
    }

    /// Kill the child, stop the reader and close the PTY.
    ///
    /// Returns once the reader has finished, even if a process that
    /// ignores SIGHUP still holds the terminal open. Safe to call
    /// repeatedly and after the child has exited.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stop.store(true, Ordering::SeqCst);
            if self.exit_status().is_none() {
                let master = self.master.lock();
                self.terminate(master.as_deref());
            }
            self.writer.lock().take();
            // Without a pollable descriptor only closing the PTY ends the read
            #[cfg(not(unix))]
            self.master.lock().take();
            debug!(command = %self.command, "session closing");
        }

        self.completion.wait();

        if let Some(handle) = self.reader_thread.lock().take() {
            if handle.join().is_err() {
                warn!("reader thread panicked");
            }
        }
        // The reader polls the master's descriptor until it returns
        self.master.lock().take();
    }
}

impl Session {
    fn terminate(&self, master: Option<&(dyn MasterPty + Send)>) {
        #[cfg(unix)]
        if let Some(pgid) = master.and_then(|m| m.process_group_leader()) {
            if pgid > 0 {
                // Background jobs of the child may still hold the slave open
                // SAFETY: killpg only sends a signal
                unsafe {
                    libc::killpg(pgid, libc::SIGHUP);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = master;

        // The child's own killer escalates past SIGHUP; the cloned one
        // is for when a concurrent wait() holds the child
        let result = match self.child.try_lock() {
            Some(mut child) => child.kill(),
            None => self.killer.lock().kill(),
        };
        if let Err(err) = result {
            debug!(error = %err, "kill failed");
        }
    }
}

impl SnapshotSource for Session {
    fn snapshot(&self) -> ScreenSnapshot {
        Session::snapshot(self)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reject dimensions that would be truncated by the OS sizing call
pub fn validate_size(dimension: &'static str, value: usize) -> Result<u16> {
    u16::try_from(value).map_err(|_| SessionError::InvalidSize { dimension, value })
}

/// Pull output until end-of-stream, a read error or a stop request.
///
/// `gate` is consulted before every read. On `Idle` any bytes the
/// interceptor is holding for a split query are released to the screen.
fn read_loop<G>(
    mut reader: Box<dyn Read + Send>,
    mut gate: G,
    screen: Arc<Mutex<Screen>>,
    mut responder: PtyWriter,
    last_error: Arc<Mutex<Option<Arc<io::Error>>>>,
    _signal: SignalOnDrop,
) where
    G: FnMut() -> Readiness,
{
    debug!("reader loop started");
    let mut interceptor = QueryInterceptor::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match gate() {
            Readiness::Ready => {}
            Readiness::Idle => {
                if !interceptor.pending().is_empty() {
                    let held = interceptor.flush();
                    debug!(bytes = held.len(), "releasing held output after idle");
                    feed(&screen, &held, &mut responder);
                }
                continue;
            }
            Readiness::Stop => {
                debug!("reader loop stopped");
                return;
            }
        }

        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if pty::is_hangup(&err) => break,
            Err(err) => {
                warn!(error = %err, "pty read failed");
                *last_error.lock() = Some(Arc::new(err));
                break;
            }
        };

        let size = screen.lock().size();
        let output = interceptor.filter(&buf[..n], size, &mut responder);
        if !output.is_empty() {
            feed(&screen, &output, &mut responder);
        }
    }

    let tail = interceptor.flush();
    if !tail.is_empty() {
        feed(&screen, &tail, &mut responder);
    }
    debug!("reader loop finished");
}

/// Apply bytes to the model, then answer its status reports outside the lock
fn feed(screen: &Mutex<Screen>, bytes: &[u8], responder: &mut PtyWriter) {
    let responses = screen.lock().model.process(bytes);
    for response in responses {
        if let Err(err) = responder.write_all(&response.to_bytes()) {
            debug!(?response, error = %err, "dropped status report");
        }
    }
}
