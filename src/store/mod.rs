pub mod sqlite;

pub use sqlite::SqliteStore;

/// Non-bookmarked projects beyond this many most-recently-used entries are
/// evicted on upsert.
pub const MAX_RECENT_PROJECTS: usize = 10;
