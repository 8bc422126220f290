//! PTY process management
//!
//! Spawns a child process attached to a pseudo-terminal and exposes the
//! master side: input writes, window resizes, termination, and exit-status
//! polling. Output reading happens on a blocking pump owned by the session
//! (see `session::manager`), fed from the reader handle returned by `spawn`.

use anyhow::{anyhow, Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;
pub const DEFAULT_TERM: &str = "xterm-256color";

/// How long a graceful termination may take before the hard kill.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct PtySpawnConfig<'a> {
    pub command: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub term: &'a str,
}

/// A live PTY child. Dropping does not kill the process; callers own the
/// lifecycle through `kill` and `poll_exit`.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Exit code recorded at first reap; the single source of truth once set.
    reaped: std::sync::Mutex<Option<i32>>,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Allocates a PTY and spawns the command on its slave side.
    ///
    /// Returns the process handle and the master-side output reader.
    pub fn spawn(config: PtySpawnConfig<'_>) -> Result<(Arc<Self>, Box<dyn Read + Send>)> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("openpty failed: {e}"))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);
        cmd.cwd(config.cwd);
        cmd.env("TERM", config.term);
        // Children keep the server's locale and lookup environment unless the
        // caller overrides a variable explicitly.
        for var in ["LANG", "HOME", "USER", "PATH", "SHELL"] {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        for (key, value) in config.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| anyhow!("spawn {program:?} failed: {e}"))?;
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| anyhow!("clone PTY reader: {e}"))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| anyhow!("take PTY writer: {e}"))?;

        info!(?pid, program = %program, cols = config.cols, rows = config.rows, "pty child spawned");

        let process = Arc::new(Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Mutex::new(Some(child)),
            killer: Mutex::new(killer),
            reaped: std::sync::Mutex::new(None),
            pid,
        });
        Ok((process, reader))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Forwards bytes verbatim to the PTY master.
    pub async fn write_input(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).context("write to pty")?;
        writer.flush().context("flush pty input")?;
        Ok(())
    }

    /// Sends a window-size change to the PTY.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow!("pty resize failed: {e}"))?;
        debug!(cols, rows, "pty resized");
        Ok(())
    }

    fn record_reap(&self, code: i32) -> i32 {
        let mut reaped = self.reaped.lock().expect("reaped lock");
        *reaped.get_or_insert(code)
    }

    /// Non-blocking status probe. `Some(code)` once the child has exited.
    pub async fn try_exit_status(&self) -> Option<i32> {
        if let Some(code) = *self.reaped.lock().expect("reaped lock") {
            return Some(code);
        }
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(c) => match c.try_wait() {
                Ok(Some(status)) => {
                    let code = self.record_reap(status.exit_code() as i32);
                    *child = None;
                    Some(code)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %e, "try_wait failed, treating child as exited");
                    let code = self.record_reap(1);
                    *child = None;
                    Some(code)
                }
            },
            None => Some(self.record_reap(0)),
        }
    }

    /// Polls until the child exits and returns its code. Later calls yield
    /// the same terminal answer.
    pub async fn wait_exit(&self) -> i32 {
        loop {
            if let Some(code) = self.try_exit_status().await {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Graceful termination: SIGTERM, then a hard kill after the grace
    /// window. Idempotent; calling on an exited child is a no-op.
    pub async fn kill(&self) {
        if self.try_exit_status().await.is_some() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed (child may be gone)");
            }
        }

        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.try_exit_status().await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        warn!(pid = ?self.pid, "grace window elapsed, hard-killing pty child");
        let mut killer = self.killer.lock().await;
        if let Err(e) = killer.kill() {
            debug!(error = %e, "hard kill failed (child may be gone)");
        }
    }
}

/// True when a process with this pid exists (signal 0 probe).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
