//! ANSI stream interpreter
//!
//! A four-state parser (ground, escape, CSI, OSC) driving the grid in
//! `buffer`. Unrecognized sequences are consumed and dropped; the emulator
//! never fails on arbitrary byte soup.

use super::buffer::{
    default_style, style_bg, style_fg, ModeFlags, Style, TerminalBuffer, STYLE_BLINK, STYLE_BOLD,
    STYLE_HIDDEN, STYLE_INVERSE, STYLE_ITALIC, STYLE_STRIKETHROUGH, STYLE_UNDERLINE,
};
use crate::stream::{AsciicastHeader, StreamEvent};

const ESC: char = '\u{1b}';
const BEL: char = '\u{07}';
const TAB_STOP: u16 = 8;

#[derive(Debug, Clone, PartialEq)]
enum ParserState {
    Ground,
    Escape,
    Csi {
        params: Vec<u16>,
        current: Option<u16>,
        private: bool,
    },
    Osc {
        buf: String,
        esc_pending: bool,
    },
}

pub struct Emulator {
    pub buffer: TerminalBuffer,
    state: ParserState,
    style: Style,
    saved_cursor: Option<(u16, u16)>,
}

impl Emulator {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            buffer: TerminalBuffer::new(cols, rows),
            state: ParserState::Ground,
            style: default_style(),
            saved_cursor: None,
        }
    }

    /// Builds an emulator by replaying a recording. Input events are
    /// ignored; resize events resize the grid.
    pub fn replay(header: &AsciicastHeader, events: &[StreamEvent]) -> Self {
        let mut emulator = Self::new(header.width, header.height);
        for event in events {
            match event {
                StreamEvent::Output { data, .. } => emulator.feed(data),
                StreamEvent::Resize { cols, rows, .. } => emulator.buffer.resize(*cols, *rows),
                StreamEvent::Input { .. } => {}
            }
        }
        emulator
    }

    pub fn feed(&mut self, data: &str) {
        for ch in data.chars() {
            self.advance(ch);
        }
    }

    fn advance(&mut self, ch: char) {
        match std::mem::replace(&mut self.state, ParserState::Ground) {
            ParserState::Ground => self.ground(ch),
            ParserState::Escape => self.escape(ch),
            ParserState::Csi {
                params,
                current,
                private,
            } => self.csi(ch, params, current, private),
            ParserState::Osc { buf, esc_pending } => self.osc(ch, buf, esc_pending),
        }
    }

    fn ground(&mut self, ch: char) {
        match ch {
            ESC => self.state = ParserState::Escape,
            '\r' => self.buffer.cursor_x = 0,
            '\n' => self.linefeed(),
            '\u{08}' => self.buffer.cursor_x = self.buffer.cursor_x.saturating_sub(1),
            '\t' => {
                let next = (self.buffer.cursor_x / TAB_STOP + 1) * TAB_STOP;
                self.buffer.cursor_x = next.min(self.buffer.cols.saturating_sub(1));
            }
            BEL => {}
            c if (c as u32) < 0x20 => {}
            c => self.print(c),
        }
    }

    fn print(&mut self, ch: char) {
        if self.buffer.cursor_x >= self.buffer.cols {
            if self.buffer.modes.contains(ModeFlags::WRAP) {
                self.buffer.cursor_x = 0;
                self.linefeed();
            } else {
                self.buffer.cursor_x = self.buffer.cols - 1;
            }
        }
        self.buffer.put(ch, self.style);
        self.buffer.cursor_x += 1;
    }

    fn linefeed(&mut self) {
        if self.buffer.cursor_y + 1 >= self.buffer.rows {
            self.buffer.scroll_up();
        } else {
            self.buffer.cursor_y += 1;
        }
    }

    fn escape(&mut self, ch: char) {
        match ch {
            '[' => {
                self.state = ParserState::Csi {
                    params: Vec::new(),
                    current: None,
                    private: false,
                }
            }
            ']' => {
                self.state = ParserState::Osc {
                    buf: String::new(),
                    esc_pending: false,
                }
            }
            'c' => self.reset(),
            '7' => self.saved_cursor = Some((self.buffer.cursor_x, self.buffer.cursor_y)),
            '8' => {
                if let Some((x, y)) = self.saved_cursor {
                    self.buffer.cursor_x = x;
                    self.buffer.cursor_y = y;
                    self.buffer.clamp_cursor();
                }
            }
            'D' => self.linefeed(),
            'M' => {
                if self.buffer.cursor_y == 0 {
                    self.buffer.scroll_down();
                } else {
                    self.buffer.cursor_y -= 1;
                }
            }
            'E' => {
                self.buffer.cursor_x = 0;
                self.linefeed();
            }
            '=' => self.buffer.modes.set(ModeFlags::APP_KEYPAD, true),
            '>' => self.buffer.modes.set(ModeFlags::APP_KEYPAD, false),
            // Unhandled escapes fall back to ground.
            _ => {}
        }
    }

    fn csi(&mut self, ch: char, mut params: Vec<u16>, current: Option<u16>, private: bool) {
        match ch {
            '0'..='9' => {
                let digit = ch as u16 - '0' as u16;
                let value = current
                    .unwrap_or(0)
                    .saturating_mul(10)
                    .saturating_add(digit);
                self.state = ParserState::Csi {
                    params,
                    current: Some(value),
                    private,
                };
            }
            ';' => {
                params.push(current.unwrap_or(0));
                self.state = ParserState::Csi {
                    params,
                    current: None,
                    private,
                };
            }
            '?' => {
                self.state = ParserState::Csi {
                    params,
                    current,
                    private: true,
                };
            }
            // Intermediates we don't act on.
            ' '..='/' => {
                self.state = ParserState::Csi {
                    params,
                    current,
                    private,
                };
            }
            '@'..='~' => {
                if let Some(value) = current {
                    params.push(value);
                }
                self.dispatch_csi(ch, &params, private);
            }
            _ => {}
        }
    }

    fn dispatch_csi(&mut self, action: char, params: &[u16], private: bool) {
        let arg = |index: usize, default: u16| params.get(index).copied().unwrap_or(default);
        match action {
            'A' => {
                self.buffer.cursor_y = self.buffer.cursor_y.saturating_sub(arg(0, 1).max(1));
            }
            'B' => {
                self.buffer.cursor_y = (self.buffer.cursor_y + arg(0, 1).max(1))
                    .min(self.buffer.rows.saturating_sub(1));
            }
            'C' => {
                self.buffer.cursor_x = (self.buffer.cursor_x + arg(0, 1).max(1))
                    .min(self.buffer.cols.saturating_sub(1));
            }
            'D' => {
                self.buffer.cursor_x = self.buffer.cursor_x.saturating_sub(arg(0, 1).max(1));
            }
            'G' => {
                self.buffer.cursor_x = arg(0, 1)
                    .max(1)
                    .saturating_sub(1)
                    .min(self.buffer.cols.saturating_sub(1));
            }
            'H' | 'f' => {
                self.buffer.cursor_y = arg(0, 1)
                    .max(1)
                    .saturating_sub(1)
                    .min(self.buffer.rows.saturating_sub(1));
                self.buffer.cursor_x = arg(1, 1)
                    .max(1)
                    .saturating_sub(1)
                    .min(self.buffer.cols.saturating_sub(1));
            }
            'J' => self.erase_in_display(arg(0, 0)),
            'K' => self.erase_in_line(arg(0, 0)),
            'm' => self.sgr(params),
            'h' => self.set_mode(params, private, true),
            'l' => self.set_mode(params, private, false),
            _ => {}
        }
    }

    fn erase_in_display(&mut self, mode: u16) {
        let (x, y) = (self.buffer.cursor_x, self.buffer.cursor_y);
        match mode {
            0 => {
                self.buffer.erase_in_row(y, x, self.buffer.cols);
                self.buffer.erase_rows(y + 1, self.buffer.rows);
            }
            1 => {
                self.buffer.erase_rows(0, y);
                self.buffer.erase_in_row(y, 0, x + 1);
            }
            2 => self.buffer.clear_screen(),
            3 => {
                self.buffer.clear_screen();
                self.buffer.scrollback.clear();
            }
            _ => {}
        }
    }

    fn erase_in_line(&mut self, mode: u16) {
        let (x, y) = (self.buffer.cursor_x, self.buffer.cursor_y);
        match mode {
            0 => self.buffer.erase_in_row(y, x, self.buffer.cols),
            1 => self.buffer.erase_in_row(y, 0, x + 1),
            2 => self.buffer.erase_in_row(y, 0, self.buffer.cols),
            _ => {}
        }
    }

    fn sgr(&mut self, params: &[u16]) {
        if params.is_empty() {
            self.style = default_style();
            return;
        }
        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => self.style = default_style(),
                1 => self.style |= STYLE_BOLD,
                3 => self.style |= STYLE_ITALIC,
                4 => self.style |= STYLE_UNDERLINE,
                5 => self.style |= STYLE_BLINK,
                7 => self.style |= STYLE_INVERSE,
                8 => self.style |= STYLE_HIDDEN,
                9 => self.style |= STYLE_STRIKETHROUGH,
                22 => self.style &= !STYLE_BOLD,
                23 => self.style &= !STYLE_ITALIC,
                24 => self.style &= !STYLE_UNDERLINE,
                25 => self.style &= !STYLE_BLINK,
                27 => self.style &= !STYLE_INVERSE,
                28 => self.style &= !STYLE_HIDDEN,
                29 => self.style &= !STYLE_STRIKETHROUGH,
                n @ 30..=37 => self.style = style_fg(self.style, (n - 30) as u8),
                38 => {
                    if params.get(i + 1) == Some(&5) {
                        if let Some(&n) = params.get(i + 2) {
                            self.style = style_fg(self.style, (n & 0xFF) as u8);
                        }
                        i += 2;
                    }
                }
                39 => self.style = style_fg(self.style, super::buffer::DEFAULT_FG),
                n @ 40..=47 => self.style = style_bg(self.style, (n - 40) as u8),
                48 => {
                    if params.get(i + 1) == Some(&5) {
                        if let Some(&n) = params.get(i + 2) {
                            self.style = style_bg(self.style, (n & 0xFF) as u8);
                        }
                        i += 2;
                    }
                }
                49 => self.style = style_bg(self.style, super::buffer::DEFAULT_BG),
                _ => {}
            }
            i += 1;
        }
    }

    fn set_mode(&mut self, params: &[u16], private: bool, on: bool) {
        for &param in params {
            match (private, param) {
                (true, 1) => self.buffer.modes.set(ModeFlags::APP_CURSOR, on),
                (true, 6) => self.buffer.modes.set(ModeFlags::ORIGIN, on),
                (true, 7) => self.buffer.modes.set(ModeFlags::WRAP, on),
                (true, 25) => self.buffer.cursor_visible = on,
                (true, 45) => self.buffer.modes.set(ModeFlags::REVERSE_WRAP, on),
                (true, 2004) => self.buffer.modes.set(ModeFlags::BRACKETED_PASTE, on),
                (false, 4) => self.buffer.modes.set(ModeFlags::INSERT, on),
                _ => {}
            }
        }
    }

    fn osc(&mut self, ch: char, mut buf: String, esc_pending: bool) {
        if esc_pending {
            // ESC \ is the string terminator; anything else aborts.
            if ch == '\\' {
                self.finish_osc(&buf);
            }
            return;
        }
        match ch {
            BEL => self.finish_osc(&buf),
            ESC => {
                self.state = ParserState::Osc {
                    buf,
                    esc_pending: true,
                }
            }
            c => {
                buf.push(c);
                self.state = ParserState::Osc {
                    buf,
                    esc_pending: false,
                };
            }
        }
    }

    fn finish_osc(&mut self, buf: &str) {
        if let Some((code, rest)) = buf.split_once(';') {
            if code == "0" || code == "2" {
                self.buffer.title = rest.to_string();
            }
        }
    }

    fn reset(&mut self) {
        let (cols, rows) = (self.buffer.cols, self.buffer.rows);
        self.buffer = TerminalBuffer::new(cols, rows);
        self.style = default_style();
        self.saved_cursor = None;
    }
}
