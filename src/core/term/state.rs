//! Screen state
//!
//! The character grid, cursor and mode flags the parser drives.

use bitflags::bitflags;
use unicode_width::UnicodeWidthChar;

/// Grid plus cursor, attribute and mode state for one screen size
pub struct ScreenState {
    pub cols: u16,
    pub rows: u16,
    pub primary: Grid,
    pub alternate: Grid,
    pub using_alternate: bool,
    pub primary_cursor: Cursor,
    pub alternate_cursor: Cursor,
    pub attrs: CellAttrs,
    pub modes: Modes,
    pub title: String,
    /// Scroll region (top, bottom) - 0-indexed, inclusive
    pub scroll_region: (u16, u16),
}

impl ScreenState {
    /// Create a blank screen. Zero dimensions are clamped to one cell.
    pub fn new(cols: u16, rows: u16) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows,
            primary: Grid::new(cols, rows),
            alternate: Grid::new(cols, rows),
            using_alternate: false,
            primary_cursor: Cursor::default(),
            alternate_cursor: Cursor::default(),
            attrs: CellAttrs::default(),
            modes: Modes::default(),
            title: String::new(),
            scroll_region: (0, rows - 1),
        }
    }

    pub fn grid(&self) -> &Grid {
        if self.using_alternate {
            &self.alternate
        } else {
            &self.primary
        }
    }

    pub fn grid_mut(&mut self) -> &mut Grid {
        if self.using_alternate {
            &mut self.alternate
        } else {
            &mut self.primary
        }
    }

    pub fn cursor(&self) -> &Cursor {
        if self.using_alternate {
            &self.alternate_cursor
        } else {
            &self.primary_cursor
        }
    }

    pub fn cursor_mut(&mut self) -> &mut Cursor {
        if self.using_alternate {
            &mut self.alternate_cursor
        } else {
            &mut self.primary_cursor
        }
    }

    /// Put a character at the current cursor position
    pub fn put_char(&mut self, ch: char) {
        let width = ch.width().unwrap_or(0) as u16;

        if width == 0 {
            self.append_to_previous_cell(ch);
            return;
        }

        // Pending wrap: the cursor sits one past the last column
        if self.cursor().col >= self.cols {
            if self.modes.auto_wrap {
                let row = self.cursor().row as usize;
                self.grid_mut().rows[row].wrapped = true;
                self.cursor_mut().col = 0;
                self.linefeed();
            } else {
                self.cursor_mut().col = self.cols - 1;
            }
        }

        // A wide glyph that would straddle the right edge wraps early
        if width == 2 && self.cursor().col + 1 >= self.cols && self.modes.auto_wrap && self.cols > 1 {
            let row = self.cursor().row as usize;
            self.grid_mut().rows[row].wrapped = true;
            self.cursor_mut().col = 0;
            self.linefeed();
        }

        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let cols = self.cols as usize;

        if self.modes.insert_mode {
            let cells = &mut self.grid_mut().rows[row].cells;
            for _ in 0..width {
                cells.pop();
                cells.insert(col, Cell::default());
            }
        }

        self.split_wide_at(row, col);

        let attrs = self.attrs;
        let line = &mut self.grid_mut().rows[row];
        line.cells[col] = Cell {
            grapheme: ch.to_string(),
            width: width as u8,
            attrs,
        };
        if width == 2 && col + 1 < cols {
            line.cells[col + 1] = Cell::continuation(attrs);
        }

        self.cursor_mut().col += width;
    }

    fn append_to_previous_cell(&mut self, ch: char) {
        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let cells = &mut self.grid_mut().rows[row].cells;
        let mut target = col.min(cells.len());
        while target > 0 {
            target -= 1;
            if !cells[target].is_continuation() {
                if !cells[target].grapheme.is_empty() {
                    cells[target].grapheme.push(ch);
                }
                return;
            }
        }
    }

    /// Blank out the halves of a wide glyph that `col` is about to overwrite
    fn split_wide_at(&mut self, row: usize, col: usize) {
        let attrs = self.attrs;
        let cells = &mut self.grid_mut().rows[row].cells;

        if col > 0 && cells[col].is_continuation() {
            cells[col - 1].clear(attrs);
        }
        if cells[col].width == 2 && col + 1 < cells.len() {
            cells[col + 1].clear(attrs);
        }
    }

    pub fn carriage_return(&mut self) {
        self.cursor_mut().col = 0;
    }

    /// Line feed - move cursor down, scroll at the bottom of the region
    pub fn linefeed(&mut self) {
        let row = self.cursor().row;
        if row == self.scroll_region.1 {
            self.scroll_up(1);
        } else if row < self.rows - 1 {
            self.cursor_mut().row += 1;
        }
        if self.modes.linefeed_newline {
            self.carriage_return();
        }
    }

    pub fn backspace(&mut self) {
        let cols = self.cols;
        let cursor = self.cursor_mut();
        cursor.col = cursor.col.min(cols - 1).saturating_sub(1);
    }

    /// Move to the next tab stop (every 8 columns)
    pub fn horizontal_tab(&mut self) {
        let cols = self.cols;
        let cursor = self.cursor_mut();
        cursor.col = ((cursor.col / 8 + 1) * 8).min(cols - 1);
    }

    /// Scroll the region up by n lines
    pub fn scroll_up(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let cols = self.cols;
        let grid = self.grid_mut();
        for _ in 0..n.min(bottom - top + 1) {
            grid.rows.remove(top as usize);
            grid.rows.insert(bottom as usize, Row::new(cols));
        }
    }

    /// Scroll the region down by n lines
    pub fn scroll_down(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let cols = self.cols;
        let grid = self.grid_mut();
        for _ in 0..n.min(bottom - top + 1) {
            grid.rows.remove(bottom as usize);
            grid.rows.insert(top as usize, Row::new(cols));
        }
    }

    pub fn cursor_up(&mut self, n: u16) {
        let cursor = self.cursor_mut();
        cursor.row = cursor.row.saturating_sub(n);
    }

    pub fn cursor_down(&mut self, n: u16) {
        let rows = self.rows;
        let cursor = self.cursor_mut();
        cursor.row = cursor.row.saturating_add(n).min(rows - 1);
    }

    pub fn cursor_forward(&mut self, n: u16) {
        let cols = self.cols;
        let cursor = self.cursor_mut();
        cursor.col = cursor.col.saturating_add(n).min(cols - 1);
    }

    pub fn cursor_backward(&mut self, n: u16) {
        let cols = self.cols;
        let cursor = self.cursor_mut();
        cursor.col = cursor.col.min(cols - 1).saturating_sub(n);
    }

    /// Set cursor position (1-indexed parameters)
    pub fn cursor_position(&mut self, row: u16, col: u16) {
        self.set_row(row.saturating_sub(1));
        self.set_col(col.saturating_sub(1));
    }

    /// Set the 0-indexed column, clamped to the grid
    pub fn set_col(&mut self, col: u16) {
        let cols = self.cols;
        self.cursor_mut().col = col.min(cols - 1);
    }

    /// Set the 0-indexed row, clamped to the grid
    pub fn set_row(&mut self, row: u16) {
        let rows = self.rows;
        self.cursor_mut().row = row.min(rows - 1);
    }

    pub fn erase_in_display(&mut self, mode: u16) {
        let row = self.cursor().row as usize;
        let attrs = self.attrs;
        match mode {
            0 => {
                self.erase_in_line(0);
                for line in self.grid_mut().rows.iter_mut().skip(row + 1) {
                    line.clear(attrs);
                }
            }
            1 => {
                for line in self.grid_mut().rows.iter_mut().take(row) {
                    line.clear(attrs);
                }
                self.erase_in_line(1);
            }
            2 | 3 => {
                for line in &mut self.grid_mut().rows {
                    line.clear(attrs);
                }
            }
            _ => {}
        }
    }

    pub fn erase_in_line(&mut self, mode: u16) {
        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.attrs;
        let line = &mut self.grid_mut().rows[row];
        let len = line.cells.len();

        let range = match mode {
            0 => col.min(len)..len,
            1 => 0..(col + 1).min(len),
            2 => 0..len,
            _ => return,
        };
        for cell in &mut line.cells[range] {
            cell.clear(attrs);
        }
        if mode != 1 {
            line.wrapped = false;
        }
    }

    /// Erase n characters starting at the cursor without moving it
    pub fn erase_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let attrs = self.attrs;
        let cells = &mut self.grid_mut().rows[row].cells;
        let end = (col + n as usize).min(cells.len());
        for cell in cells.iter_mut().take(end).skip(col) {
            cell.clear(attrs);
        }
    }

    /// Insert n blank characters at the cursor, shifting the rest right
    pub fn insert_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let cells = &mut self.grid_mut().rows[row].cells;
        if col >= cells.len() {
            return;
        }
        for _ in 0..(n as usize).min(cells.len() - col) {
            cells.pop();
            cells.insert(col, Cell::default());
        }
    }

    /// Delete n characters at the cursor, shifting the rest left
    pub fn delete_chars(&mut self, n: u16) {
        let (row, col) = {
            let cursor = self.cursor();
            (cursor.row as usize, cursor.col as usize)
        };
        let cells = &mut self.grid_mut().rows[row].cells;
        if col >= cells.len() {
            return;
        }
        for _ in 0..(n as usize).min(cells.len() - col) {
            cells.remove(col);
            cells.push(Cell::default());
        }
    }

    /// Insert lines at the cursor row, inside the scroll region
    pub fn insert_lines(&mut self, n: u16) {
        let row = self.cursor().row;
        let (top, bottom) = self.scroll_region;
        if row < top || row > bottom {
            return;
        }
        let cols = self.cols;
        let grid = self.grid_mut();
        for _ in 0..n.min(bottom - row + 1) {
            grid.rows.remove(bottom as usize);
            grid.rows.insert(row as usize, Row::new(cols));
        }
    }

    /// Delete lines at the cursor row, inside the scroll region
    pub fn delete_lines(&mut self, n: u16) {
        let row = self.cursor().row;
        let (top, bottom) = self.scroll_region;
        if row < top || row > bottom {
            return;
        }
        let cols = self.cols;
        let grid = self.grid_mut();
        for _ in 0..n.min(bottom - row + 1) {
            grid.rows.remove(row as usize);
            grid.rows.insert(bottom as usize, Row::new(cols));
        }
    }

    /// Set scroll region (1-indexed, inclusive)
    pub fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        let last = self.rows - 1;
        let top = top.saturating_sub(1).min(last);
        let bottom = bottom.saturating_sub(1).min(last);
        if top < bottom {
            self.scroll_region = (top, bottom);
        }
    }

    pub fn save_cursor(&mut self) {
        let attrs = self.attrs;
        let cursor = self.cursor_mut();
        cursor.saved = Some(SavedCursor {
            col: cursor.col,
            row: cursor.row,
            attrs,
        });
    }

    pub fn restore_cursor(&mut self) {
        if let Some(saved) = self.cursor().saved {
            let cursor = self.cursor_mut();
            cursor.col = saved.col;
            cursor.row = saved.row;
            self.attrs = saved.attrs;
        }
    }

    /// DEC private mode set/reset
    pub fn set_private_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            1 => self.modes.application_cursor = enable,
            7 => self.modes.auto_wrap = enable,
            25 => self.cursor_mut().visible = enable,
            47 | 1047 => self.switch_alternate(enable),
            1048 => {
                if enable {
                    self.save_cursor();
                } else {
                    self.restore_cursor();
                }
            }
            1049 => {
                if enable {
                    self.save_cursor();
                    self.switch_alternate(true);
                    self.alternate_cursor = Cursor::default();
                } else {
                    self.switch_alternate(false);
                    self.restore_cursor();
                }
            }
            2004 => self.modes.bracketed_paste = enable,
            _ => {}
        }
    }

    fn switch_alternate(&mut self, enable: bool) {
        if enable && !self.using_alternate {
            self.alternate = Grid::new(self.cols, self.rows);
        }
        self.using_alternate = enable;
    }

    /// Reverse index - cursor up, scroll down at the top of the region
    pub fn reverse_index(&mut self) {
        if self.cursor().row == self.scroll_region.0 {
            self.scroll_down(1);
        } else {
            self.cursor_up(1);
        }
    }

    /// Render the visible grid as text, one `\n`-terminated line per row
    pub fn render_text(&self) -> String {
        let grid = self.grid();
        let mut out = String::with_capacity((self.cols as usize + 1) * self.rows as usize);
        for row in &grid.rows {
            for cell in &row.cells {
                if cell.is_continuation() {
                    continue;
                }
                out.push_str(cell.display());
            }
            out.push('\n');
        }
        out
    }
}

/// A screen's worth of rows
pub struct Grid {
    pub rows: Vec<Row>,
}

impl Grid {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows: (0..rows).map(|_| Row::new(cols)).collect(),
        }
    }
}

/// A single row
pub struct Row {
    pub cells: Vec<Cell>,
    /// Set when the row ended in an auto-wrap
    pub wrapped: bool,
}

impl Row {
    pub fn new(cols: u16) -> Self {
        Self {
            cells: vec![Cell::default(); cols as usize],
            wrapped: false,
        }
    }

    pub fn clear(&mut self, attrs: CellAttrs) {
        for cell in &mut self.cells {
            cell.clear(attrs);
        }
        self.wrapped = false;
    }
}

/// A single cell
#[derive(Clone, Debug)]
pub struct Cell {
    pub grapheme: String,
    /// Display width; 0 marks the right half of a wide glyph
    pub width: u8,
    pub attrs: CellAttrs,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            grapheme: String::new(),
            width: 1,
            attrs: CellAttrs::default(),
        }
    }
}

impl Cell {
    pub fn clear(&mut self, attrs: CellAttrs) {
        self.grapheme.clear();
        self.width = 1;
        self.attrs = attrs;
    }

    pub fn continuation(attrs: CellAttrs) -> Self {
        Self {
            grapheme: String::new(),
            width: 0,
            attrs,
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.width == 0
    }

    /// Text shown for the cell (a space when empty)
    pub fn display(&self) -> &str {
        if self.grapheme.is_empty() {
            " "
        } else {
            &self.grapheme
        }
    }
}

/// Cell attributes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CellAttrs {
    pub fg: Color,
    pub bg: Color,
    pub flags: AttrFlags,
}

impl CellAttrs {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AttrFlags: u16 {
        const BOLD          = 0b0000_0000_0001;
        const DIM           = 0b0000_0000_0010;
        const ITALIC        = 0b0000_0000_0100;
        const UNDERLINE     = 0b0000_0000_1000;
        const BLINK         = 0b0000_0001_0000;
        const INVERSE       = 0b0000_0010_0000;
        const HIDDEN        = 0b0000_0100_0000;
        const STRIKETHROUGH = 0b0000_1000_0000;
    }
}

/// Cursor state
#[derive(Clone, Copy, Debug)]
pub struct Cursor {
    pub col: u16,
    pub row: u16,
    pub visible: bool,
    pub saved: Option<SavedCursor>,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            col: 0,
            row: 0,
            visible: true,
            saved: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SavedCursor {
    pub col: u16,
    pub row: u16,
    pub attrs: CellAttrs,
}

/// Terminal modes
#[derive(Clone, Debug)]
pub struct Modes {
    pub application_cursor: bool,
    pub auto_wrap: bool,
    pub insert_mode: bool,
    pub linefeed_newline: bool,
    pub bracketed_paste: bool,
}

impl Default for Modes {
    fn default() -> Self {
        Self {
            application_cursor: false,
            auto_wrap: true,
            insert_mode: false,
            linefeed_newline: false,
            bracketed_paste: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_str(state: &mut ScreenState, s: &str) {
        for ch in s.chars() {
            state.put_char(ch);
        }
    }

    fn line(state: &ScreenState, row: usize) -> String {
        state.render_text().lines().nth(row).unwrap_or_default().to_string()
    }

    #[test]
    fn test_blank_render_dimensions() {
        let state = ScreenState::new(5, 3);
        assert_eq!(state.render_text(), "     \n     \n     \n");
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let state = ScreenState::new(0, 0);
        assert_eq!((state.cols, state.rows), (1, 1));
        assert_eq!(state.render_text(), " \n");
    }

    #[test]
    fn test_auto_wrap() {
        let mut state = ScreenState::new(4, 2);
        put_str(&mut state, "abcdef");
        assert_eq!(line(&state, 0), "abcd");
        assert_eq!(line(&state, 1), "ef  ");
        assert!(state.grid().rows[0].wrapped);
    }

    #[test]
    fn test_scroll_at_bottom() {
        let mut state = ScreenState::new(3, 2);
        put_str(&mut state, "a");
        state.carriage_return();
        state.linefeed();
        put_str(&mut state, "b");
        state.carriage_return();
        state.linefeed();
        put_str(&mut state, "c");
        assert_eq!(state.render_text(), "b  \nc  \n");
    }

    #[test]
    fn test_wide_char_occupies_two_columns() {
        let mut state = ScreenState::new(4, 1);
        put_str(&mut state, "日x");
        assert_eq!(state.cursor().col, 3);
        assert_eq!(state.render_text(), "日x \n");
    }

    #[test]
    fn test_alternate_screen_restores_primary() {
        let mut state = ScreenState::new(3, 1);
        put_str(&mut state, "abc");
        state.set_private_mode(1049, true);
        assert_eq!(state.render_text(), "   \n");
        put_str(&mut state, "z");
        state.set_private_mode(1049, false);
        assert_eq!(state.render_text(), "abc\n");
    }

    #[test]
    fn test_erase_in_line_from_cursor() {
        let mut state = ScreenState::new(5, 1);
        put_str(&mut state, "hello");
        state.set_col(2);
        state.erase_in_line(0);
        assert_eq!(state.render_text(), "he   \n");
    }
}
