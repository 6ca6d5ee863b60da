//! Pseudo-terminal boundary
//!
//! Opens a PTY pair through `portable-pty`, spawns the child on the slave
//! side and hands the master-side handles to the session.

use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::io::RawFd;
#[cfg(unix)]
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pseudo terminal: {0}")]
    Open(#[source] anyhow::Error),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to resize pseudo terminal: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("failed to clone pseudo terminal reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take pseudo terminal writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to wait for child: {0}")]
    Wait(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// What to run and how big the terminal is
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Extra `KEY=VALUE` pairs on top of the inherited environment
    pub env: Vec<(String, String)>,
    pub term: String,
    pub rows: u16,
    pub cols: u16,
}

/// Master-side handles of a freshly spawned child
pub struct Pty {
    pub master: Box<dyn MasterPty + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl Pty {
    /// Open a PTY of `spec.rows` x `spec.cols` and start the child on it
    pub fn spawn(spec: &SpawnSpec) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(PtyError::Open)?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", &spec.term);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|source| PtyError::Spawn {
                command: spec.command.clone(),
                source,
            })?;
        // The child holds its own copy; keeping ours would hide EOF
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(PtyError::CloneReader)?;
        let writer = pair.master.take_writer().map_err(PtyError::TakeWriter)?;

        debug!(
            command = %spec.command,
            pid = ?child.process_id(),
            rows = spec.rows,
            cols = spec.cols,
            "spawned child on pty"
        );

        Ok(Self {
            master: pair.master,
            child,
            reader,
            writer,
        })
    }
}

/// Propagate a new window size to the OS-level PTY
pub fn resize(master: &dyn MasterPty, cols: u16, rows: u16) -> Result<()> {
    master
        .resize(pty_size(cols, rows))
        .map_err(PtyError::Resize)
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Whether a read error on the master means the child side hung up
///
/// Linux reports a closed slave as `EIO` rather than a zero-length read.
pub fn is_hangup(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EIO) {
        return true;
    }
    err.kind() == io::ErrorKind::BrokenPipe
}

/// Wait up to `timeout` for `fd` to become readable
///
/// Hang-up and error conditions count as readable so the following read
/// reports them. An interrupted wait returns `Ok(false)`.
#[cfg(unix)]
pub fn poll_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
    if ready < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ready > 0 && pollfd.revents != 0)
}

/// Split a `KEY=VALUE` pair; entries without `=` are ignored
pub fn parse_env_pair(entry: &str) -> Option<(String, String)> {
    let (key, value) = entry.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.to_string()))
}
