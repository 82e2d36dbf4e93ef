//! Storage error types.

use thiserror::Error;

/// Errors from the shared database.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Database file or transaction failure.
    ///
    /// Covers open, begin, commit and table access errors reported by redb.
    #[error("I/O error: {0}")]
    Io(String),

    /// A stored row could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A sealed pickle could not be opened.
    #[error("pickle error: {0}")]
    Pickle(String),

    /// The database holds tables no known component declared.
    ///
    /// Usually another program (a homeserver, another bridge) was pointed at
    /// the same file.
    #[error("database contains foreign tables: {}", .0.join(", "))]
    ForeignTables(Vec<String>),

    /// The database was created by a different program.
    #[error("database is owned by {owner:?}, not {expected:?}")]
    NotOwned {
        /// Owner recorded in the database
        owner: String,
        /// Our owner name
        expected: String,
    },

    /// The stored schema is newer than this build supports.
    #[error("{component} schema version {found} is newer than supported version {latest}")]
    UnsupportedVersion {
        /// Schema component
        component: String,
        /// Version recorded in the database
        found: u32,
        /// Latest version this build knows
        latest: u32,
    },
}
