//! ptyshot - run a TUI program in a pseudo-terminal and capture its screen
//! as plain text.
//!
//! The [`core`] module holds the session engine: the PTY, the capability
//! query interceptor, the virtual screen and the stability waits.
//! [`capture`] drives a complete capture the way the binary does.
//!
//! ```no_run
//! use std::time::Duration;
//! use ptyshot::core::{wait_for_stable, Session, SessionOptions};
//!
//! let session = Session::new("htop", &[], &SessionOptions::default())?;
//! wait_for_stable(&session, Duration::from_secs(5), Duration::from_millis(200))?;
//! print!("{}", session.snapshot().text);
//! session.close();
//! # Ok::<(), ptyshot::core::SessionError>(())
//! ```

pub mod capture;
pub mod config;
pub mod core;
pub mod keys;
