// dyocense-store-sqlite/src/connection.rs
// ============================================================================
// Module: SQLite Connection Helpers
// Description: Path validation and secure-default connection opening.
// Purpose: Share one hardened connection-opening routine across backends.
// Dependencies: rusqlite
// ============================================================================

//! ## Overview
//! Both [`crate::store::SqliteKernelStore`] and any future `SQLite`-backed
//! component open their connection through [`open_connection`], which
//! applies WAL journaling, a configurable synchronous mode, and a busy
//! timeout before any schema work begins.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::Path;

use rusqlite::Connection;
use rusqlite::OpenFlags;

use crate::error::SqliteStoreError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum length of a single path component.
pub const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub const MAX_TOTAL_PATH_LENGTH: usize = 4096;

// ============================================================================
// SECTION: Sync Mode
// ============================================================================

/// `SQLite` `PRAGMA synchronous` setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SqliteSyncMode {
    /// Full synchronous mode: fsync on every commit.
    #[default]
    Full,
    /// Normal synchronous mode: fsync at WAL checkpoints only.
    Normal,
}

impl SqliteSyncMode {
    /// Returns the `SQLite` pragma value for this mode.
    #[must_use]
    pub const fn pragma_value(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Normal => "normal",
        }
    }
}

// ============================================================================
// SECTION: Path Validation
// ============================================================================

/// Validates a store path against length limits and ensures it is not an
/// existing directory.
///
/// # Errors
///
/// Returns [`SqliteStoreError::Invalid`] when the path is too long, has an
/// overlong component, or already exists as a directory.
pub fn validate_store_path(path: &Path) -> Result<(), SqliteStoreError> {
    let path_string = path.display().to_string();
    if path_string.len() > MAX_TOTAL_PATH_LENGTH {
        return Err(SqliteStoreError::Invalid("store path exceeds length limit".to_string()));
    }
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(SqliteStoreError::Invalid(
                "store path contains an overlong component".to_string(),
            ));
        }
    }
    if path.exists() && path.is_dir() {
        return Err(SqliteStoreError::Invalid(
            "store path must be a file, not a directory".to_string(),
        ));
    }
    Ok(())
}

/// Creates the store's parent directory if it does not already exist.
///
/// # Errors
///
/// Returns [`SqliteStoreError::Io`] when the directory cannot be created.
pub fn ensure_parent_dir(path: &Path) -> Result<(), SqliteStoreError> {
    let Some(parent) = path.parent() else {
        return Err(SqliteStoreError::Io("store path missing parent directory".to_string()));
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent).map_err(|err| SqliteStoreError::Io(err.to_string()))
}

// ============================================================================
// SECTION: Connection
// ============================================================================

/// Opens an `SQLite` connection at `path` with WAL journaling, the given
/// synchronous mode, and the given busy timeout.
///
/// # Errors
///
/// Returns [`SqliteStoreError::Db`] when the connection cannot be opened or
/// configured.
pub fn open_connection(
    path: &Path,
    sync_mode: SqliteSyncMode,
    busy_timeout_ms: u64,
) -> Result<Connection, SqliteStoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let connection = Connection::open_with_flags(path, flags)
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = wal;")
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .execute_batch(&format!("PRAGMA synchronous = {};", sync_mode.pragma_value()))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    connection
        .busy_timeout(std::time::Duration::from_millis(busy_timeout_ms))
        .map_err(|err| SqliteStoreError::Db(err.to_string()))?;
    Ok(connection)
}
