//! Terminal grid state
//!
//! A `cols x rows` matrix of styled cells plus a bounded scrollback. This is
//! derived state only; the stream file remains the source of truth.

use serde::{Deserialize, Serialize};

/// Packed style word. Bits 0-7 foreground, 8-15 background, then one flag
/// bit each: 16 bold, 17 italic, 18 underline, 19 blink, 20 inverse,
/// 21 hidden, 22 strikethrough.
pub type Style = u32;

pub const STYLE_BOLD: Style = 1 << 16;
pub const STYLE_ITALIC: Style = 1 << 17;
pub const STYLE_UNDERLINE: Style = 1 << 18;
pub const STYLE_BLINK: Style = 1 << 19;
pub const STYLE_INVERSE: Style = 1 << 20;
pub const STYLE_HIDDEN: Style = 1 << 21;
pub const STYLE_STRIKETHROUGH: Style = 1 << 22;

/// The 8-color default pair: white on black.
pub const DEFAULT_FG: u8 = 7;
pub const DEFAULT_BG: u8 = 0;

pub fn default_style() -> Style {
    style_with_colors(0, DEFAULT_FG, DEFAULT_BG)
}

pub fn style_with_colors(style: Style, fg: u8, bg: u8) -> Style {
    (style & !0xFFFF) | (fg as Style) | ((bg as Style) << 8)
}

pub fn style_fg(style: Style, fg: u8) -> Style {
    (style & !0xFF) | fg as Style
}

pub fn style_bg(style: Style, bg: u8) -> Style {
    (style & !0xFF00) | ((bg as Style) << 8)
}

/// One character cell. The glyph is a string so combining sequences survive
/// a round trip through the snapshot encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    #[serde(rename = "char")]
    pub ch: String,
    pub style: Style,
}

impl Cell {
    pub fn blank(style: Style) -> Self {
        Self {
            ch: " ".to_string(),
            style,
        }
    }
}

impl Default for Cell {
    fn default() -> Self {
        Cell::blank(default_style())
    }
}

/// Terminal mode flags, packed exactly as the snapshot's flags byte:
/// bit 0 application keypad, 1 application cursor, 2 bracketed paste,
/// 3 origin, 4 reverse wraparound, 5 wraparound, 6 insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeFlags(pub u8);

impl ModeFlags {
    pub const APP_KEYPAD: u8 = 1 << 0;
    pub const APP_CURSOR: u8 = 1 << 1;
    pub const BRACKETED_PASTE: u8 = 1 << 2;
    pub const ORIGIN: u8 = 1 << 3;
    pub const REVERSE_WRAP: u8 = 1 << 4;
    pub const WRAP: u8 = 1 << 5;
    pub const INSERT: u8 = 1 << 6;

    pub fn set(&mut self, flag: u8, on: bool) {
        if on {
            self.0 |= flag;
        } else {
            self.0 &= !flag;
        }
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

impl Default for ModeFlags {
    fn default() -> Self {
        // Wraparound is on in a reset terminal.
        ModeFlags(Self::WRAP)
    }
}

const MAX_SCROLLBACK: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct TerminalBuffer {
    pub cols: u16,
    pub rows: u16,
    pub grid: Vec<Vec<Cell>>,
    pub scrollback: Vec<Vec<Cell>>,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub cursor_visible: bool,
    pub title: String,
    pub modes: ModeFlags,
}

impl TerminalBuffer {
    pub fn new(cols: u16, rows: u16) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows,
            grid: vec![vec![Cell::default(); cols as usize]; rows as usize],
            scrollback: Vec::new(),
            cursor_x: 0,
            cursor_y: 0,
            cursor_visible: true,
            title: String::new(),
            modes: ModeFlags::default(),
        }
    }

    pub fn blank_row(&self) -> Vec<Cell> {
        vec![Cell::default(); self.cols as usize]
    }

    /// Writes a glyph at the cursor without moving it.
    pub fn put(&mut self, ch: char, style: Style) {
        let (x, y) = (self.cursor_x as usize, self.cursor_y as usize);
        if y < self.grid.len() && x < self.grid[y].len() {
            self.grid[y][x] = Cell {
                ch: ch.to_string(),
                style,
            };
        }
    }

    /// Pushes the top row into scrollback and appends a blank one.
    pub fn scroll_up(&mut self) {
        if self.grid.is_empty() {
            return;
        }
        let row = self.grid.remove(0);
        self.scrollback.push(row);
        if self.scrollback.len() > MAX_SCROLLBACK {
            let excess = self.scrollback.len() - MAX_SCROLLBACK;
            self.scrollback.drain(..excess);
        }
        let blank = self.blank_row();
        self.grid.push(blank);
    }

    /// Inserts a blank row at the top, dropping the bottom one.
    pub fn scroll_down(&mut self) {
        if self.grid.is_empty() {
            return;
        }
        self.grid.pop();
        let blank = self.blank_row();
        self.grid.insert(0, blank);
    }

    pub fn clamp_cursor(&mut self) {
        self.cursor_x = self.cursor_x.min(self.cols.saturating_sub(1));
        self.cursor_y = self.cursor_y.min(self.rows.saturating_sub(1));
    }

    /// Blanks a cell range on one row, inclusive start, exclusive end.
    pub fn erase_in_row(&mut self, row: u16, from: u16, to: u16) {
        let row = row as usize;
        if row >= self.grid.len() {
            return;
        }
        let to = (to as usize).min(self.grid[row].len());
        for x in (from as usize)..to {
            self.grid[row][x] = Cell::default();
        }
    }

    pub fn erase_rows(&mut self, from: u16, to: u16) {
        for row in from..to.min(self.rows) {
            self.erase_in_row(row, 0, self.cols);
        }
    }

    pub fn clear_screen(&mut self) {
        self.erase_rows(0, self.rows);
    }

    /// Adjusts dimensions, truncating or padding rows and columns.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.max(1);
        let rows = rows.max(1);
        for row in self.grid.iter_mut() {
            row.resize(cols as usize, Cell::default());
        }
        while self.grid.len() > rows as usize {
            let row = self.grid.remove(0);
            self.scrollback.push(row);
        }
        while self.grid.len() < rows as usize {
            self.grid.push(vec![Cell::default(); cols as usize]);
        }
        self.cols = cols;
        self.rows = rows;
        self.clamp_cursor();
    }

    /// The visible grid as plain text, one string per row. Test helper and
    /// the base for the JSON buffer response.
    pub fn row_text(&self, row: usize) -> String {
        self.grid
            .get(row)
            .map(|cells| cells.iter().map(|c| c.ch.as_str()).collect::<String>())
            .unwrap_or_default()
    }
}
