//! HQ federation: remote registry, health probing, proxying, registration.

mod announce;
pub mod proxy;
mod registry;

pub use announce::HqAnnouncer;
pub use registry::{
    RegisterRemote, RemoteCleanupResult, RemoteRecord, RemoteRegistry, RemoteSummary,
    HEALTH_INTERVAL, PROBE_TIMEOUT,
};
