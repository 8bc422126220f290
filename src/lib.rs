//! VibeTunnel - remote terminal-session multiplexer
//!
//! Spawns PTY sessions on behalf of remote clients, records their output as
//! append-only asciicast streams, fans live events out to SSE and WebSocket
//! subscribers, and optionally federates a fleet of servers behind an HQ.

pub mod auth;
pub mod config;
pub mod error;
pub mod fs_api;
pub mod hq;
pub mod live;
pub mod pty;
pub mod server;
pub mod session;
pub mod stream;
pub mod term;

pub use config::ServerConfig;
pub use error::{ApiError, ApiResult};
pub use live::Broadcaster;
pub use server::{build_router, run_server, AppState};
pub use session::{SessionInfo, SessionManager, SessionStatus};
pub use stream::{AsciicastHeader, StreamEvent, StreamWriter};
pub use term::{BufferSnapshot, Emulator};
