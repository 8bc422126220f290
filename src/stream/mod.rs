//! Asciicast v2 stream files
//!
//! A stream file is a newline-delimited sequence: one JSON header object
//! followed by three-element JSON event arrays. The file is the source of
//! truth for a session's output; everything else (live fan-out, snapshots,
//! buffer state) derives from it.

mod event;
mod reader;
mod writer;

pub use event::{AsciicastHeader, StreamEvent, ASCIICAST_VERSION};
pub use reader::{read_header, read_events_from, snapshot, StreamTail};
pub use writer::StreamWriter;
