//! Polling synchronizers over screen snapshots.
//!
//! The screen model has no change notification, so both waits re-snapshot
//! every [`POLL_INTERVAL`] until their condition holds or the deadline
//! passes. Cursor state is ignored; only the rendered text is compared.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::session::{Result, ScreenSnapshot, SessionError};

pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Anything that can produce a point-in-time screen
pub trait SnapshotSource {
    fn snapshot(&self) -> ScreenSnapshot;
}

/// Which wait ran out of time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutKind {
    Stable { timeout: Duration },
    Text { text: String, timeout: Duration },
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Stable { timeout } => {
                write!(f, "screen did not stabilize within {:?}", timeout)
            }
            TimeoutKind::Text { text, timeout } => {
                write!(f, "text {:?} did not appear within {:?}", text, timeout)
            }
        }
    }
}

/// Wait until the rendered text has stayed identical for `stable_for`
pub fn wait_for_stable<S>(source: &S, timeout: Duration, stable_for: Duration) -> Result<()>
where
    S: SnapshotSource + ?Sized,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut last: Option<String> = None;
    let mut unchanged_since = start;

    loop {
        let now = Instant::now();
        if now >= deadline {
            debug!(?timeout, "wait for stable screen timed out");
            return Err(SessionError::Timeout(TimeoutKind::Stable { timeout }));
        }

        let text = source.snapshot().text;
        match &last {
            Some(prev) if *prev == text => {
                if now.duration_since(unchanged_since) >= stable_for {
                    debug!(elapsed = ?start.elapsed(), "screen stable");
                    return Ok(());
                }
            }
            _ => {
                last = Some(text);
                unchanged_since = now;
            }
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Wait until the rendered text contains `text`. An empty target never matches.
pub fn wait_for_text<S>(source: &S, text: &str, timeout: Duration) -> Result<()>
where
    S: SnapshotSource + ?Sized,
{
    let deadline = Instant::now() + timeout;

    loop {
        if Instant::now() >= deadline {
            debug!(text, ?timeout, "wait for text timed out");
            return Err(SessionError::Timeout(TimeoutKind::Text {
                text: text.to_string(),
                timeout,
            }));
        }

        if !text.is_empty() && source.snapshot().text.contains(text) {
            return Ok(());
        }

        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Plays back a fixed sequence of screens, repeating the last one
    struct Scripted {
        frames: Vec<String>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(frames: &[&str]) -> Self {
            Self {
                frames: frames.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    impl SnapshotSource for Scripted {
        fn snapshot(&self) -> ScreenSnapshot {
            let mut calls = self.calls.lock();
            let index = (*calls).min(self.frames.len() - 1);
            *calls += 1;
            snapshot_of(&self.frames[index])
        }
    }

    /// Changes on every call, so it never settles
    struct Ticking {
        counter: Mutex<u64>,
    }

    impl SnapshotSource for Ticking {
        fn snapshot(&self) -> ScreenSnapshot {
            let mut counter = self.counter.lock();
            *counter += 1;
            snapshot_of(&format!("frame {}", counter))
        }
    }

    /// Flips between two screens, so neighbouring polls never match
    struct Alternating {
        counter: Mutex<u64>,
    }

    impl SnapshotSource for Alternating {
        fn snapshot(&self) -> ScreenSnapshot {
            let mut counter = self.counter.lock();
            *counter += 1;
            snapshot_of(if *counter % 2 == 0 { "a" } else { "b" })
        }
    }

    fn snapshot_of(text: &str) -> ScreenSnapshot {
        ScreenSnapshot {
            text: text.to_string(),
            cursor_row: 0,
            cursor_col: 0,
            cursor_visible: true,
            rows: 1,
            cols: 10,
        }
    }

    #[test]
    fn test_stable_after_changes_settle() {
        let source = Scripted::new(&["one", "two", "three", "done"]);
        let start = Instant::now();
        wait_for_stable(&source, Duration::from_secs(5), Duration::from_millis(120)).unwrap();

        // Three changing frames, then at least 120ms of "done"
        assert!(source.calls() >= 6);
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[test]
    fn test_stable_requires_continuous_dwell() {
        let source = Alternating {
            counter: Mutex::new(0),
        };
        let result = wait_for_stable(&source, Duration::from_millis(400), Duration::from_millis(100));
        assert!(matches!(
            result,
            Err(SessionError::Timeout(TimeoutKind::Stable { .. }))
        ));
    }

    #[test]
    fn test_never_stable_times_out() {
        let source = Ticking {
            counter: Mutex::new(0),
        };
        let start = Instant::now();
        let err = wait_for_stable(&source, Duration::from_millis(200), Duration::from_millis(50))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_zero_timeout_fails_immediately() {
        let source = Scripted::new(&["static"]);
        let err = wait_for_stable(&source, Duration::ZERO, Duration::ZERO).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(source.calls(), 0);
    }

    #[test]
    fn test_text_found() {
        let source = Scripted::new(&["loading", "loading.", "Main Menu"]);
        wait_for_text(&source, "Main Menu", Duration::from_secs(5)).unwrap();
        assert_eq!(source.calls(), 3);
    }

    #[test]
    fn test_text_missing_times_out() {
        let source = Scripted::new(&["nothing here"]);
        let err = wait_for_text(&source, "Ready", Duration::from_millis(150)).unwrap_err();
        match err {
            SessionError::Timeout(TimeoutKind::Text { text, .. }) => assert_eq!(text, "Ready"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_text_never_matches() {
        let source = Scripted::new(&["anything at all"]);
        let err = wait_for_text(&source, "", Duration::from_millis(120)).unwrap_err();
        assert!(err.is_timeout());
    }
}
