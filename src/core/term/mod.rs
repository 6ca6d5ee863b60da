//! Virtual screen model.
//!
//! [`VirtualScreen`] turns the child's output into a character grid. It
//! answers the device-status queries (`ESC[5n`, `ESC[6n`) itself because
//! only it knows where the cursor is; the replies are handed back to the
//! caller to write to the PTY.

pub mod parser;
pub mod state;

pub use parser::{Response, VtParser};
pub use state::{AttrFlags, CellAttrs, Color, ScreenState};

/// Parser + grid for one fixed screen size
pub struct VirtualScreen {
    state: ScreenState,
    parser: VtParser,
    /// Leading bytes of a UTF-8 sequence split across reads
    utf8_tail: Vec<u8>,
}

impl VirtualScreen {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            state: ScreenState::new(cols, rows),
            parser: VtParser::new(),
            utf8_tail: Vec::new(),
        }
    }

    /// Apply output bytes, returning any replies owed to the child
    pub fn process(&mut self, bytes: &[u8]) -> Vec<Response> {
        let mut responses = Vec::new();

        let joined;
        let mut input = bytes;
        if !self.utf8_tail.is_empty() {
            let mut buf = std::mem::take(&mut self.utf8_tail);
            buf.extend_from_slice(bytes);
            joined = buf;
            input = joined.as_slice();
        }

        let mut i = 0;
        while i < input.len() {
            let b = input[i];
            if b < 0x80 {
                if let Some(response) = self.parser.feed(b, &mut self.state) {
                    responses.push(response);
                }
                i += 1;
                continue;
            }

            let seq_len = utf8_len(b);
            if i + seq_len > input.len() && seq_len > 1 {
                // Incomplete sequence at the end of this read
                self.utf8_tail = input[i..].to_vec();
                break;
            }

            match std::str::from_utf8(&input[i..i + seq_len]) {
                Ok(s) => {
                    for ch in s.chars() {
                        if let Some(response) = self.parser.feed_char(ch, &mut self.state) {
                            responses.push(response);
                        }
                    }
                    i += seq_len;
                }
                Err(_) => {
                    self.parser.feed_char(char::REPLACEMENT_CHARACTER, &mut self.state);
                    i += 1;
                }
            }
        }

        responses
    }

    /// Grid as text: `cols` columns per row, each row ending in `\n`
    pub fn render_text(&self) -> String {
        self.state.render_text()
    }

    /// Cursor as (row, col, visible), 0-indexed and clamped to the grid
    pub fn cursor(&self) -> (u16, u16, bool) {
        let cursor = self.state.cursor();
        (
            cursor.row,
            cursor.col.min(self.state.cols - 1),
            cursor.visible,
        )
    }

    pub fn title(&self) -> &str {
        &self.state.title
    }
}

fn utf8_len(lead: u8) -> usize {
    if lead & 0xE0 == 0xC0 {
        2
    } else if lead & 0xF0 == 0xE0 {
        3
    } else if lead & 0xF8 == 0xF0 {
        4
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_is_deterministic() {
        let mut screen = VirtualScreen::new(10, 3);
        screen.process(b"hello\r\nworld");
        let first = screen.render_text();
        assert_eq!(first, screen.render_text());
        assert_eq!(first.lines().count(), 3);
        assert!(first.lines().all(|l| l.chars().count() == 10));
    }

    #[test]
    fn test_utf8_split_across_reads() {
        let mut screen = VirtualScreen::new(6, 1);
        let bytes = "é!".as_bytes();
        screen.process(&bytes[..1]);
        screen.process(&bytes[1..]);
        assert_eq!(screen.render_text(), "é!    \n");
    }

    #[test]
    fn test_invalid_utf8_renders_replacement() {
        let mut screen = VirtualScreen::new(3, 1);
        screen.process(&[0xFF, b'a']);
        assert_eq!(screen.render_text(), "\u{FFFD}a \n");
    }

    #[test]
    fn test_cursor_report_and_visibility() {
        let mut screen = VirtualScreen::new(10, 5);
        let responses = screen.process(b"\x1b[2;4H\x1b[?25l\x1b[6n");
        assert_eq!(responses, vec![Response::CursorPosition(2, 4)]);
        assert_eq!(screen.cursor(), (1, 3, false));
    }

    #[test]
    fn test_cursor_clamped_after_full_line() {
        let mut screen = VirtualScreen::new(3, 2);
        screen.process(b"abc");
        assert_eq!(screen.cursor(), (0, 2, true));
    }
}
