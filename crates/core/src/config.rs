//! Orchestrator configuration.
//!
//! Resolved once at process startup by the embedding server and passed into
//! [`crate::ServerContext::new`]; nothing here is read from the environment
//! during request handling.

use std::time::Duration;

/// Tunables of the orchestration core.
#[derive(Clone, Debug)]
pub struct ContextConfig {
    /// Whether new blobs are compressed before hitting the storage area.
    pub compression_enabled: bool,
    /// Whether content digests are recorded for new blobs. Required for
    /// idempotent-store detection and read-time integrity verification.
    pub store_digest: bool,
    /// Maximum number of parsed instances kept in memory.
    pub cache_capacity: usize,
    /// Maximum number of transient result sets in the shared archive.
    pub archive_capacity: usize,
    /// Age past which shared-archive entries are evicted.
    pub archive_max_age: Duration,
    /// Idle period after which the held outbound association is torn down.
    pub association_idle_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            compression_enabled: false,
            store_digest: true,
            cache_capacity: 128,
            archive_capacity: 32,
            archive_max_age: Duration::from_secs(30 * 60),
            association_idle_timeout: Duration::from_secs(60),
        }
    }
}
