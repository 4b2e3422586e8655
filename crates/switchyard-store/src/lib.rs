//! Persistence collaborators for Switchyard.
//!
//! All stores implement [`switchyard_core::Persistence`]:
//!
//! - [`MemoryStore`]: process-local, for tests and ephemeral runs.
//! - [`FileStore`]: one JSON file per record.
//! - `SqliteStore`: a single SQLite table (feature `sqlite`).

/// JSON-file store.
pub mod file;
/// In-memory store.
pub mod memory;
/// SQLite store.
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
