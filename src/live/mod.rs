//! Live fan-out: SSE event delivery and the buffer WebSocket.

mod broadcaster;
pub mod ws;

pub use broadcaster::{Broadcaster, LiveEvent, SUBSCRIBER_QUEUE};
