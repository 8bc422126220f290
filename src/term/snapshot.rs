//! Buffer snapshot serialization
//!
//! The wire picture of a terminal grid at one moment. Two forms: a JSON
//! object for debugging-friendly clients and the little-endian binary layout
//! for the low-bandwidth path:
//!
//! ```text
//! "SNAP" | version u32 | cols u32 | rows u32 | cursorX u32 | cursorY u32
//! cursorVisible u8 | scrollbackLen u32 | line* | bufferLen u32 | line*
//! titleLen u32 | title utf8 | flags u8
//! line = lineByteLen u32 | cellCount u32 | cell*
//! cell = charByteLen u32 | char utf8 | style u32
//! ```

use super::buffer::{Cell, ModeFlags, TerminalBuffer};
use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

const MAGIC: &[u8; 4] = b"SNAP";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferSnapshot {
    pub cols: u32,
    pub rows: u32,
    pub cursor_x: u32,
    pub cursor_y: u32,
    pub cursor_visible: bool,
    pub title: String,
    /// Mode flag bitset, same layout as the binary flags byte.
    pub modes: u8,
    pub scrollback: Vec<Vec<Cell>>,
    pub buffer: Vec<Vec<Cell>>,
}

/// Summary numbers for the stats endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStats {
    pub lines: usize,
    pub cells: usize,
    pub scrollback_lines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&TerminalBuffer> for BufferSnapshot {
    fn from(buffer: &TerminalBuffer) -> Self {
        Self {
            cols: buffer.cols as u32,
            rows: buffer.rows as u32,
            cursor_x: buffer.cursor_x as u32,
            cursor_y: buffer.cursor_y as u32,
            cursor_visible: buffer.cursor_visible,
            title: buffer.title.clone(),
            modes: buffer.modes.0,
            scrollback: buffer.scrollback.clone(),
            buffer: buffer.grid.clone(),
        }
    }
}

impl BufferSnapshot {
    pub fn stats(&self, last_modified: Option<chrono::DateTime<chrono::Utc>>) -> BufferStats {
        BufferStats {
            lines: self.buffer.len(),
            cells: self.buffer.iter().map(Vec::len).sum(),
            scrollback_lines: self.scrollback.len(),
            last_modified,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(1024);
        out.put_slice(MAGIC);
        out.put_u32_le(SNAPSHOT_VERSION);
        out.put_u32_le(self.cols);
        out.put_u32_le(self.rows);
        out.put_u32_le(self.cursor_x);
        out.put_u32_le(self.cursor_y);
        out.put_u8(self.cursor_visible as u8);

        out.put_u32_le(self.scrollback.len() as u32);
        for line in &self.scrollback {
            encode_line(&mut out, line);
        }
        out.put_u32_le(self.buffer.len() as u32);
        for line in &self.buffer {
            encode_line(&mut out, line);
        }

        out.put_u32_le(self.title.len() as u32);
        out.put_slice(self.title.as_bytes());
        out.put_u8(self.modes);
        out.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;
        if buf.remaining() < 4 || &buf[..4] != MAGIC {
            bail!("bad snapshot magic");
        }
        buf.advance(4);
        let version = read_u32(&mut buf)?;
        if version != SNAPSHOT_VERSION {
            bail!("unsupported snapshot version {version}");
        }
        let cols = read_u32(&mut buf)?;
        let rows = read_u32(&mut buf)?;
        let cursor_x = read_u32(&mut buf)?;
        let cursor_y = read_u32(&mut buf)?;
        let cursor_visible = read_u8(&mut buf)? != 0;

        let scrollback_len = read_u32(&mut buf)? as usize;
        let mut scrollback = Vec::with_capacity(scrollback_len.min(4096));
        for _ in 0..scrollback_len {
            scrollback.push(decode_line(&mut buf)?);
        }
        let buffer_len = read_u32(&mut buf)? as usize;
        let mut buffer = Vec::with_capacity(buffer_len.min(4096));
        for _ in 0..buffer_len {
            buffer.push(decode_line(&mut buf)?);
        }

        let title_len = read_u32(&mut buf)? as usize;
        if buf.remaining() < title_len {
            bail!("truncated snapshot title");
        }
        let title = String::from_utf8(buf[..title_len].to_vec())
            .map_err(|_| anyhow!("snapshot title is not UTF-8"))?;
        buf.advance(title_len);
        let modes = read_u8(&mut buf)?;

        Ok(Self {
            cols,
            rows,
            cursor_x,
            cursor_y,
            cursor_visible,
            title,
            modes,
            scrollback,
            buffer,
        })
    }

    /// The mode flags as a typed value.
    pub fn mode_flags(&self) -> ModeFlags {
        ModeFlags(self.modes)
    }
}

fn encode_line(out: &mut BytesMut, line: &[Cell]) {
    let mut cells = BytesMut::new();
    for cell in line {
        cells.put_u32_le(cell.ch.len() as u32);
        cells.put_slice(cell.ch.as_bytes());
        cells.put_u32_le(cell.style);
    }
    // lineByteLen counts the cell payload after the cellCount word.
    out.put_u32_le(cells.len() as u32);
    out.put_u32_le(line.len() as u32);
    out.put_slice(&cells);
}

fn decode_line(buf: &mut &[u8]) -> Result<Vec<Cell>> {
    let byte_len = read_u32(buf)? as usize;
    let cell_count = read_u32(buf)? as usize;
    if buf.remaining() < byte_len {
        bail!("truncated snapshot line");
    }
    let mut line_bytes = &buf[..byte_len];
    buf.advance(byte_len);

    let mut cells = Vec::with_capacity(cell_count.min(4096));
    for _ in 0..cell_count {
        let char_len = read_u32(&mut line_bytes)? as usize;
        if line_bytes.remaining() < char_len {
            bail!("truncated snapshot cell");
        }
        let ch = String::from_utf8(line_bytes[..char_len].to_vec())
            .map_err(|_| anyhow!("snapshot cell is not UTF-8"))?;
        line_bytes.advance(char_len);
        let style = read_u32(&mut line_bytes)?;
        cells.push(Cell { ch, style });
    }
    Ok(cells)
}

fn read_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        bail!("truncated snapshot");
    }
    Ok(buf.get_u32_le())
}

fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    if buf.remaining() < 1 {
        bail!("truncated snapshot");
    }
    Ok(buf.get_u8())
}
