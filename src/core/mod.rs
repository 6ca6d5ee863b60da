//! Core terminal session components.
//!
//! - **pty**: `portable-pty` wrapper that spawns the child on a pseudo-terminal
//! - **query**: recognises capability queries in the child's output and answers them
//! - **term**: virtual screen (VT parser + cell grid)
//! - **session**: PTY + reader thread + screen behind one lock
//! - **wait**: polling waits for a stable screen or for text to appear
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── Pty (child process, master reader/writer)
//! ├── reader thread
//! │   ├── QueryInterceptor (DA, window size, colour queries)
//! │   └── VirtualScreen (grid + cursor, answers DSR/CPR)
//! └── snapshot() ──> wait_for_stable / wait_for_text
//! ```

pub mod pty;
pub mod query;
pub mod session;
pub mod term;
pub mod wait;

pub use session::{ScreenSnapshot, Session, SessionError, SessionOptions};
pub use wait::{wait_for_stable, wait_for_text, SnapshotSource, TimeoutKind};
