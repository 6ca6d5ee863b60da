//! VT sequence parser
//!
//! Byte-at-a-time state machine that applies ANSI/VT sequences to a
//! [`ScreenState`] and reports the device-status answers the child expects.

use super::state::{AttrFlags, Color, ScreenState};

/// Reply that must be written back to the PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Cursor position report: ESC [ row ; col R (1-indexed)
    CursorPosition(u16, u16),
    /// Operating status report: ESC [ 0 n
    StatusOk,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::CursorPosition(row, col) => format!("\x1b[{};{}R", row, col).into_bytes(),
            Response::StatusOk => b"\x1b[0n".to_vec(),
        }
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
enum State {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    CsiIgnore,
    OscString,
    /// ESC seen inside an OSC string, waiting for the backslash of ST
    OscEscape,
}

/// Parser state machine
pub struct VtParser {
    state: State,
    params: Vec<u16>,
    intermediates: Vec<u8>,
    current_param: Option<u16>,
    osc: Vec<u8>,
}

impl Default for VtParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest OSC payload kept; the remainder is dropped
const MAX_OSC_LEN: usize = 4096;

impl VtParser {
    pub fn new() -> Self {
        Self {
            state: State::Ground,
            params: Vec::with_capacity(16),
            intermediates: Vec::with_capacity(4),
            current_param: None,
            osc: Vec::new(),
        }
    }

    /// Feed a decoded character. Non-ASCII characters only ever print.
    pub fn feed_char(&mut self, ch: char, screen: &mut ScreenState) -> Option<Response> {
        if ch.is_ascii() {
            return self.feed(ch as u8, screen);
        }
        match self.state {
            State::Ground => screen.put_char(ch),
            State::OscString => {
                if self.osc.len() < MAX_OSC_LEN {
                    let mut buf = [0u8; 4];
                    self.osc.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                }
            }
            _ => {}
        }
        None
    }

    /// Feed a single ASCII / control byte
    pub fn feed(&mut self, byte: u8, screen: &mut ScreenState) -> Option<Response> {
        let in_osc = matches!(self.state, State::OscString | State::OscEscape);
        if byte < 0x20 && !in_osc {
            match byte {
                0x1B => self.enter_escape(),
                0x08 => screen.backspace(),
                0x09 => screen.horizontal_tab(),
                0x0A..=0x0C => screen.linefeed(),
                0x0D => screen.carriage_return(),
                0x18 | 0x1A => self.state = State::Ground,
                _ => {}
            }
            return None;
        }

        match self.state {
            State::Ground => {
                if (0x20..0x7F).contains(&byte) {
                    screen.put_char(byte as char);
                }
                None
            }
            State::Escape => {
                self.escape(byte, screen);
                None
            }
            State::EscapeIntermediate => {
                // Charset designations and the like; nothing to render
                if !(0x20..=0x2F).contains(&byte) {
                    self.state = State::Ground;
                }
                None
            }
            State::CsiEntry | State::CsiParam => self.csi_param(byte, screen),
            State::CsiIntermediate => match byte {
                0x20..=0x2F => {
                    self.intermediates.push(byte);
                    None
                }
                0x40..=0x7E => self.execute_csi(byte, screen),
                _ => {
                    self.state = State::CsiIgnore;
                    None
                }
            },
            State::CsiIgnore => {
                if (0x40..=0x7E).contains(&byte) {
                    self.state = State::Ground;
                }
                None
            }
            State::OscString => {
                match byte {
                    0x07 => self.finish_osc(screen),
                    0x1B => self.state = State::OscEscape,
                    // CAN/SUB cancel the string without applying it
                    0x18 | 0x1A => self.abort_osc(),
                    _ => {
                        if self.osc.len() < MAX_OSC_LEN {
                            self.osc.push(byte);
                        }
                    }
                }
                None
            }
            State::OscEscape if matches!(byte, 0x18 | 0x1A) => {
                self.abort_osc();
                None
            }
            State::OscEscape => {
                self.finish_osc(screen);
                if byte != b'\\' {
                    // Not ST: the ESC started a new sequence
                    self.enter_escape();
                    self.escape(byte, screen);
                }
                None
            }
        }
    }

    fn enter_escape(&mut self) {
        self.state = State::Escape;
        self.params.clear();
        self.intermediates.clear();
        self.current_param = None;
    }

    fn escape(&mut self, byte: u8, screen: &mut ScreenState) {
        self.state = State::Ground;
        match byte {
            b'[' => self.state = State::CsiEntry,
            b']' => {
                self.osc.clear();
                self.state = State::OscString;
            }
            b'7' => screen.save_cursor(),
            b'8' => screen.restore_cursor(),
            b'D' => screen.linefeed(),
            b'E' => {
                screen.carriage_return();
                screen.linefeed();
            }
            b'M' => screen.reverse_index(),
            b'c' => *screen = ScreenState::new(screen.cols, screen.rows),
            0x20..=0x2F => {
                self.intermediates.push(byte);
                self.state = State::EscapeIntermediate;
            }
            _ => {}
        }
    }

    fn csi_param(&mut self, byte: u8, screen: &mut ScreenState) -> Option<Response> {
        match byte {
            b'0'..=b'9' => {
                let digit = u16::from(byte - b'0');
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
                self.state = State::CsiParam;
            }
            b';' | b':' => {
                self.params.push(self.current_param.take().unwrap_or(0));
                self.state = State::CsiParam;
            }
            b'?' | b'>' | b'=' | b'<' if self.state == State::CsiEntry => {
                self.intermediates.push(byte);
            }
            0x20..=0x2F => {
                if let Some(p) = self.current_param.take() {
                    self.params.push(p);
                }
                self.intermediates.push(byte);
                self.state = State::CsiIntermediate;
            }
            0x40..=0x7E => {
                if let Some(p) = self.current_param.take() {
                    self.params.push(p);
                }
                return self.execute_csi(byte, screen);
            }
            _ => self.state = State::CsiIgnore,
        }
        None
    }

    fn param(&self, index: usize, default: u16) -> u16 {
        match self.params.get(index).copied() {
            Some(0) | None => default,
            Some(value) => value,
        }
    }

    fn execute_csi(&mut self, final_byte: u8, screen: &mut ScreenState) -> Option<Response> {
        self.state = State::Ground;

        let private = self.intermediates.first().copied();
        let has_space = self.intermediates.contains(&b' ');

        match (private, final_byte) {
            (None, b'A') => screen.cursor_up(self.param(0, 1)),
            (None, b'B') | (None, b'e') => screen.cursor_down(self.param(0, 1)),
            (None, b'C') | (None, b'a') => screen.cursor_forward(self.param(0, 1)),
            (None, b'D') => screen.cursor_backward(self.param(0, 1)),
            (None, b'E') => {
                screen.cursor_down(self.param(0, 1));
                screen.carriage_return();
            }
            (None, b'F') => {
                screen.cursor_up(self.param(0, 1));
                screen.carriage_return();
            }
            (None, b'G') | (None, b'`') => screen.set_col(self.param(0, 1) - 1),
            (None, b'H') | (None, b'f') => {
                screen.cursor_position(self.param(0, 1), self.param(1, 1));
            }
            (None, b'd') => screen.set_row(self.param(0, 1) - 1),
            (None, b'J') => screen.erase_in_display(self.params.first().copied().unwrap_or(0)),
            (None, b'K') => screen.erase_in_line(self.params.first().copied().unwrap_or(0)),
            (None, b'L') => screen.insert_lines(self.param(0, 1)),
            (None, b'M') => screen.delete_lines(self.param(0, 1)),
            (None, b'@') if !has_space => screen.insert_chars(self.param(0, 1)),
            (None, b'P') => screen.delete_chars(self.param(0, 1)),
            (None, b'X') => screen.erase_chars(self.param(0, 1)),
            (None, b'S') => screen.scroll_up(self.param(0, 1)),
            (None, b'T') => screen.scroll_down(self.param(0, 1)),
            (None, b'r') => {
                let bottom = self.param(1, screen.rows);
                screen.set_scroll_region(self.param(0, 1), bottom);
                screen.cursor_position(1, 1);
            }
            (None, b'm') => self.execute_sgr(screen),
            (None, b's') => screen.save_cursor(),
            (None, b'u') => screen.restore_cursor(),
            (None, b'n') => {
                return match self.params.first() {
                    Some(5) => Some(Response::StatusOk),
                    Some(6) => {
                        let cursor = screen.cursor();
                        let col = cursor.col.min(screen.cols - 1);
                        Some(Response::CursorPosition(cursor.row + 1, col + 1))
                    }
                    _ => None,
                };
            }
            (Some(b'?'), b'h') => {
                for &p in &self.params {
                    screen.set_private_mode(p, true);
                }
            }
            (Some(b'?'), b'l') => {
                for &p in &self.params {
                    screen.set_private_mode(p, false);
                }
            }
            (None, b'h') | (None, b'l') => {
                let enable = final_byte == b'h';
                for &p in &self.params {
                    match p {
                        4 => screen.modes.insert_mode = enable,
                        20 => screen.modes.linefeed_newline = enable,
                        _ => {}
                    }
                }
            }
            _ => {
                tracing::trace!(
                    intermediates = ?self.intermediates,
                    params = ?self.params,
                    final_byte = %(final_byte as char),
                    "unhandled CSI"
                );
            }
        }
        None
    }

    fn execute_sgr(&self, screen: &mut ScreenState) {
        if self.params.is_empty() {
            screen.attrs.reset();
            return;
        }

        let attrs = &mut screen.attrs;
        let mut iter = self.params.iter().copied();

        while let Some(param) = iter.next() {
            match param {
                0 => attrs.reset(),
                1 => attrs.flags |= AttrFlags::BOLD,
                2 => attrs.flags |= AttrFlags::DIM,
                3 => attrs.flags |= AttrFlags::ITALIC,
                4 => attrs.flags |= AttrFlags::UNDERLINE,
                5 => attrs.flags |= AttrFlags::BLINK,
                7 => attrs.flags |= AttrFlags::INVERSE,
                8 => attrs.flags |= AttrFlags::HIDDEN,
                9 => attrs.flags |= AttrFlags::STRIKETHROUGH,
                22 => attrs.flags &= !(AttrFlags::BOLD | AttrFlags::DIM),
                23 => attrs.flags &= !AttrFlags::ITALIC,
                24 => attrs.flags &= !AttrFlags::UNDERLINE,
                25 => attrs.flags &= !AttrFlags::BLINK,
                27 => attrs.flags &= !AttrFlags::INVERSE,
                28 => attrs.flags &= !AttrFlags::HIDDEN,
                29 => attrs.flags &= !AttrFlags::STRIKETHROUGH,
                30..=37 => attrs.fg = Color::Indexed((param - 30) as u8),
                38 => {
                    if let Some(color) = extended_color(&mut iter) {
                        attrs.fg = color;
                    }
                }
                39 => attrs.fg = Color::Default,
                40..=47 => attrs.bg = Color::Indexed((param - 40) as u8),
                48 => {
                    if let Some(color) = extended_color(&mut iter) {
                        attrs.bg = color;
                    }
                }
                49 => attrs.bg = Color::Default,
                90..=97 => attrs.fg = Color::Indexed((param - 90 + 8) as u8),
                100..=107 => attrs.bg = Color::Indexed((param - 100 + 8) as u8),
                _ => {}
            }
        }
    }

    fn abort_osc(&mut self) {
        self.state = State::Ground;
        self.osc.clear();
    }

    fn finish_osc(&mut self, screen: &mut ScreenState) {
        self.state = State::Ground;
        let payload = String::from_utf8_lossy(&self.osc);
        if let Some((code, text)) = payload.split_once(';') {
            if matches!(code, "0" | "1" | "2") {
                screen.title = text.to_string();
            }
        }
        self.osc.clear();
    }
}

/// `38;5;n` / `38;2;r;g;b` tail of an SGR parameter list
fn extended_color(iter: &mut impl Iterator<Item = u16>) -> Option<Color> {
    match iter.next()? {
        5 => iter.next().map(|n| Color::Indexed(n as u8)),
        2 => {
            let r = iter.next().unwrap_or(0) as u8;
            let g = iter.next().unwrap_or(0) as u8;
            let b = iter.next().unwrap_or(0) as u8;
            Some(Color::Rgb(r, g, b))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut VtParser, screen: &mut ScreenState, bytes: &[u8]) -> Vec<Response> {
        bytes
            .iter()
            .filter_map(|&b| parser.feed(b, screen))
            .collect()
    }

    #[test]
    fn test_cursor_movement() {
        let mut screen = ScreenState::new(80, 24);
        let mut parser = VtParser::new();

        feed_all(&mut parser, &mut screen, b"\x1b[5;10H");

        assert_eq!(screen.cursor().row, 4);
        assert_eq!(screen.cursor().col, 9);
    }

    #[test]
    fn test_sgr_colors() {
        let mut screen = ScreenState::new(80, 24);
        let mut parser = VtParser::new();

        feed_all(&mut parser, &mut screen, b"\x1b[1;31m\x1b[48;2;1;2;3m");

        assert_eq!(screen.attrs.fg, Color::Indexed(1));
        assert_eq!(screen.attrs.bg, Color::Rgb(1, 2, 3));
        assert!(screen.attrs.flags.contains(AttrFlags::BOLD));
    }

    #[test]
    fn test_cursor_position_report() {
        let mut screen = ScreenState::new(80, 24);
        let mut parser = VtParser::new();

        let responses = feed_all(&mut parser, &mut screen, b"\x1b[3;7H\x1b[6n\x1b[5n");

        assert_eq!(
            responses,
            vec![Response::CursorPosition(3, 7), Response::StatusOk]
        );
        assert_eq!(responses[0].to_bytes(), b"\x1b[3;7R");
    }

    #[test]
    fn test_device_attributes_are_not_answered() {
        let mut screen = ScreenState::new(80, 24);
        let mut parser = VtParser::new();

        assert!(feed_all(&mut parser, &mut screen, b"\x1b[c\x1b[>c").is_empty());
        assert_eq!(screen.render_text().trim(), "");
    }

    #[test]
    fn test_osc_title_with_st_and_bel() {
        let mut screen = ScreenState::new(20, 2);
        let mut parser = VtParser::new();

        feed_all(&mut parser, &mut screen, b"\x1b]0;first\x07");
        assert_eq!(screen.title, "first");

        feed_all(&mut parser, &mut screen, b"\x1b]2;second\x1b\\ok");
        assert_eq!(screen.title, "second");
        assert!(screen.render_text().starts_with("ok"));
    }

    #[test]
    fn test_cancelled_osc_is_dropped() {
        let mut screen = ScreenState::new(20, 2);
        let mut parser = VtParser::new();

        feed_all(&mut parser, &mut screen, b"\x1b]2;lost\x18shown");
        assert_eq!(screen.title, "");
        assert!(screen.render_text().starts_with("shown"));

        feed_all(&mut parser, &mut screen, b"\r\x1b]11;?\x1b\x1aagain");
        assert!(screen.render_text().starts_with("again"));
    }

    #[test]
    fn test_hide_cursor() {
        let mut screen = ScreenState::new(10, 2);
        let mut parser = VtParser::new();

        feed_all(&mut parser, &mut screen, b"\x1b[?25l");
        assert!(!screen.cursor().visible);
        feed_all(&mut parser, &mut screen, b"\x1b[?25h");
        assert!(screen.cursor().visible);
    }

    #[test]
    fn test_clear_screen_and_home() {
        let mut screen = ScreenState::new(5, 2);
        let mut parser = VtParser::new();

        feed_all(&mut parser, &mut screen, b"abc\r\nxyz\x1b[2J\x1b[Hq");
        assert_eq!(screen.render_text(), "q    \n     \n");
    }
}
