//! Append-only writer for stream files.
//!
//! The header line is written and flushed before any event. Each event is a
//! single whole-line append; the writer never seeks or truncates.

use super::event::{AsciicastHeader, StreamEvent};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::debug;

pub struct StreamWriter {
    file: File,
    started: Instant,
    header: AsciicastHeader,
}

impl StreamWriter {
    /// Creates the file and writes the header line.
    pub fn create(
        path: &Path,
        width: u16,
        height: u16,
        command: Option<String>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut header = AsciicastHeader::new(width, height, chrono::Utc::now().timestamp());
        header.command = command;
        if let Some(env) = env {
            header.env = env;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open stream file {}", path.display()))?;

        let mut line = serde_json::to_string(&header)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        file.flush()?;
        debug!(path = %path.display(), width, height, "stream header written");

        Ok(Self {
            file,
            started: Instant::now(),
            header,
        })
    }

    pub fn header(&self) -> &AsciicastHeader {
        &self.header
    }

    /// Seconds since the header timestamp.
    pub fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn append_output(&mut self, data: &str) -> Result<()> {
        let time = self.elapsed();
        self.append_event(&StreamEvent::Output {
            time,
            data: data.to_string(),
        })
    }

    pub fn append_input(&mut self, data: &str) -> Result<()> {
        let time = self.elapsed();
        self.append_event(&StreamEvent::Input {
            time,
            data: data.to_string(),
        })
    }

    pub fn append_resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        let time = self.elapsed();
        self.append_event(&StreamEvent::Resize { time, cols, rows })
    }

    fn append_event(&mut self, event: &StreamEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        // One write_all per line keeps the append whole even if we crash
        // mid-session; readers only ever parse newline-terminated lines.
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}
