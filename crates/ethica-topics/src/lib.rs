//! Canonical event topic constants shared by connectors and their observers.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Connector lifecycle
pub const TOPIC_CONNECTOR_CONNECTED: &str = "connector.connected";
pub const TOPIC_CONNECTOR_DISCONNECTED: &str = "connector.disconnected";

// Sync scheduler
pub const TOPIC_SYNC_COMPLETED: &str = "sync.completed";
pub const TOPIC_SYNC_FAILED: &str = "sync.failed";
pub const TOPIC_SYNC_SKIPPED: &str = "sync.skipped";
pub const TOPIC_SYNC_STARTED: &str = "sync.started";

// Cache manager
pub const TOPIC_CACHE_INVALIDATED: &str = "cache.invalidated";
pub const TOPIC_CACHE_SWEPT: &str = "cache.swept";

// Records (domain events)
pub const TOPIC_RECORDS_CHANGED: &str = "records.changed";
pub const TOPIC_RECORDS_DELETED: &str = "records.deleted";
pub const TOPIC_RECORDS_DROPPED: &str = "records.dropped";

// Real-time channel
pub const TOPIC_REALTIME_STATE: &str = "realtime.state";

// Remote API
pub const TOPIC_REMOTE_RETRY: &str = "remote.retry";
pub const TOPIC_REMOTE_UNAVAILABLE: &str = "remote.unavailable";

/// Every topic above, for subscribers that filter by prefix.
pub const ALL_TOPICS: &[&str] = &[
    TOPIC_CONNECTOR_CONNECTED,
    TOPIC_CONNECTOR_DISCONNECTED,
    TOPIC_SYNC_COMPLETED,
    TOPIC_SYNC_FAILED,
    TOPIC_SYNC_SKIPPED,
    TOPIC_SYNC_STARTED,
    TOPIC_CACHE_INVALIDATED,
    TOPIC_CACHE_SWEPT,
    TOPIC_RECORDS_CHANGED,
    TOPIC_RECORDS_DELETED,
    TOPIC_RECORDS_DROPPED,
    TOPIC_REALTIME_STATE,
    TOPIC_REMOTE_RETRY,
    TOPIC_REMOTE_UNAVAILABLE,
];
