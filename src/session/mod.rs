//! Session store and lifecycle management.

mod info;
mod manager;

pub use info::{
    info_path, load_info, session_dir, store_info, stream_in_path, stream_last_modified,
    stream_out_path, SessionInfo, SessionListEntry, SessionStatus, INFO_FILE, STREAM_IN_FILE,
    STREAM_OUT_FILE,
};
pub use manager::{input_bytes, CreateSession, LiveSession, SessionManager};
