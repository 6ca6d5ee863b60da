//! Terminal capability query interception.
//!
//! TUI frameworks query the terminal during start-up (device attributes,
//! window size, default colours) and often block until they get an
//! answer. This module recognises those queries in the child's output,
//! strips them so they never reach the screen model, and produces the
//! replies a real terminal would send.
//!
//! Device-status reports (`ESC[5n`, `ESC[6n`) are left in the stream on
//! purpose: the screen model answers them from its own cursor state.
//!
//! # Recognised queries
//!
//! | Query              | Reply                          |
//! |--------------------|--------------------------------|
//! | `ESC[c`, `ESC[0c`  | `ESC[?62;4c`                   |
//! | `ESC[>c`, `ESC[>0c`| `ESC[>1;0;0c`                  |
//! | `ESC[14t`          | `ESC[4;<rows*16>;<cols*8>t`    |
//! | `ESC[18t`          | `ESC[8;<rows>;<cols>t`         |
//! | `ESC[19t`          | `ESC[9;<rows>;<cols>t`         |
//! | `ESC]10;…ST/BEL`   | `ESC]10;rgb:ffff/ffff/ffff ST` |
//! | `ESC]11;…ST/BEL`   | `ESC]11;rgb:0000/0000/0000 ST` |

use std::io::Write;

use tracing::{debug, warn};

const ESC: u8 = 0x1B;
const BEL: u8 = 0x07;

/// Synthetic cell size used for the pixel-size reply
const CELL_HEIGHT_PX: u32 = 16;
const CELL_WIDTH_PX: u32 = 8;

/// Longest unresolved tail held back for the next read
pub const MAX_CARRY: usize = 256;

/// Terminal dimensions the size replies are built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

/// A recognised capability query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// Primary device attributes (DA1)
    PrimaryAttributes,
    /// Secondary device attributes (DA2)
    SecondaryAttributes,
    /// XTWINOPS 14: window size in pixels
    WindowSizePixels,
    /// XTWINOPS 18: text area size in characters
    TextAreaSize,
    /// XTWINOPS 19: screen size in characters
    ScreenSize,
    /// OSC 10: default foreground colour
    ForegroundColor,
    /// OSC 11: default background colour
    BackgroundColor,
}

impl Query {
    /// Reply bytes for this query at the given size
    pub fn response(self, size: TermSize) -> Vec<u8> {
        let rows = u32::from(size.rows);
        let cols = u32::from(size.cols);
        match self {
            // 62 = VT220, 4 = sixel
            Query::PrimaryAttributes => b"\x1b[?62;4c".to_vec(),
            Query::SecondaryAttributes => b"\x1b[>1;0;0c".to_vec(),
            Query::WindowSizePixels => format!(
                "\x1b[4;{};{}t",
                rows * CELL_HEIGHT_PX,
                cols * CELL_WIDTH_PX
            )
            .into_bytes(),
            Query::TextAreaSize => format!("\x1b[8;{};{}t", rows, cols).into_bytes(),
            Query::ScreenSize => format!("\x1b[9;{};{}t", rows, cols).into_bytes(),
            Query::ForegroundColor => b"\x1b]10;rgb:ffff/ffff/ffff\x1b\\".to_vec(),
            Query::BackgroundColor => b"\x1b]11;rgb:0000/0000/0000\x1b\\".to_vec(),
        }
    }
}

/// Fixed-length CSI queries, written without the leading ESC
const CSI_QUERIES: &[(&[u8], Query)] = &[
    (b"[c", Query::PrimaryAttributes),
    (b"[0c", Query::PrimaryAttributes),
    (b"[>c", Query::SecondaryAttributes),
    (b"[>0c", Query::SecondaryAttributes),
    (b"[14t", Query::WindowSizePixels),
    (b"[18t", Query::TextAreaSize),
    (b"[19t", Query::ScreenSize),
];

/// OSC query headers, written without the leading ESC. The body runs to BEL or ST.
const OSC_QUERIES: &[(&[u8], Query)] = &[
    (b"]10;", Query::ForegroundColor),
    (b"]11;", Query::BackgroundColor),
];

/// A query recognised at `offset` spanning `len` source bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMatch {
    pub offset: usize,
    pub len: usize,
    pub query: Query,
    /// Bytes to write back to the PTY; empty means nothing to send
    pub response: Vec<u8>,
}

/// Result of scanning one buffer
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Scan {
    /// Bytes destined for the screen model
    pub output: Vec<u8>,
    /// Recognised queries, in stream order
    pub matches: Vec<QueryMatch>,
    /// Offset of a trailing sequence that may still become a query once
    /// more bytes arrive; `None` when the whole buffer was resolved
    pub unresolved: Option<usize>,
}

enum Recognition {
    Complete(Query, usize),
    Incomplete,
    NoMatch,
}

/// Scan `data` for capability queries.
///
/// Pure: nothing is written anywhere. Bytes from `unresolved` onwards are
/// neither in `output` nor matched.
pub fn scan(data: &[u8], size: TermSize) -> Scan {
    let mut scan = Scan {
        output: Vec::with_capacity(data.len()),
        ..Scan::default()
    };

    let mut i = 0;
    while i < data.len() {
        if data[i] == ESC {
            match recognize(&data[i..]) {
                Recognition::Complete(query, len) => {
                    scan.matches.push(QueryMatch {
                        offset: i,
                        len,
                        query,
                        response: query.response(size),
                    });
                    i += len;
                    continue;
                }
                Recognition::Incomplete => {
                    scan.unresolved = Some(i);
                    break;
                }
                Recognition::NoMatch => {}
            }
        }
        scan.output.push(data[i]);
        i += 1;
    }

    scan
}

fn recognize(rest: &[u8]) -> Recognition {
    debug_assert_eq!(rest.first(), Some(&ESC));
    let body = &rest[1..];
    let mut incomplete = body.is_empty();

    for &(pattern, query) in CSI_QUERIES {
        if body.starts_with(pattern) {
            return Recognition::Complete(query, pattern.len() + 1);
        }
        incomplete |= pattern.starts_with(body);
    }

    for &(header, query) in OSC_QUERIES {
        if body.starts_with(header) {
            let start = header.len() + 1;
            return match find_osc_end(rest, start) {
                Some(end) => Recognition::Complete(query, end),
                None if rest.len() < MAX_CARRY => Recognition::Incomplete,
                None => Recognition::NoMatch,
            };
        }
        incomplete |= header.starts_with(body);
    }

    if incomplete {
        Recognition::Incomplete
    } else {
        Recognition::NoMatch
    }
}

/// Position just past the OSC terminator (BEL or ESC \), searching from `from`
fn find_osc_end(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i < data.len() {
        match data[i] {
            BEL => return Some(i + 1),
            ESC if data.get(i + 1) == Some(&b'\\') => return Some(i + 2),
            _ => i += 1,
        }
    }
    None
}

/// Stateful interceptor for one PTY output stream.
///
/// Wraps [`scan`] with a carry-over buffer so a query split across two
/// reads is still recognised.
#[derive(Debug, Default)]
pub struct QueryInterceptor {
    pending: Vec<u8>,
}

impl QueryInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one read's worth of output.
    ///
    /// Replies are written to `responder` in stream order as they are
    /// found. Returns the bytes that should reach the screen model. A
    /// failed reply write is logged and otherwise ignored.
    pub fn filter(&mut self, chunk: &[u8], size: TermSize, responder: &mut dyn Write) -> Vec<u8> {
        let data;
        let input = if self.pending.is_empty() {
            chunk
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(chunk);
            data = joined;
            data.as_slice()
        };

        let scan = scan(input, size);

        for m in &scan.matches {
            debug!(query = ?m.query, offset = m.offset, len = m.len, "intercepted terminal query");
            if m.response.is_empty() {
                continue;
            }
            if let Err(err) = responder.write_all(&m.response).and_then(|()| responder.flush()) {
                warn!(query = ?m.query, error = %err, "failed to answer terminal query");
            }
        }

        if let Some(offset) = scan.unresolved {
            self.pending = input[offset..].to_vec();
        }

        scan.output
    }

    /// Release any carried bytes as plain output (end of stream)
    pub fn flush(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    /// Bytes currently held back
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}
