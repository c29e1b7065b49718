//! Error types for track-store
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)
//!
//! "Nothing matched" is never an error: lookups and `fetch_and_update_*`
//! return `Ok(None)` so callers can tell an empty claim queue apart from
//! a broken storage.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of entity an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// Top-level project
    Project,
    /// Trial group (namespace inside a project)
    TrialGroup,
    /// Single trial
    Trial,
}

impl EntityKind {
    /// Name used in the persisted `dtype` discriminator
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::TrialGroup => "trial_group",
            Self::Trial => "trial",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// track-store error types
#[derive(Error, Debug)]
pub enum Error {
    /// An entity with the same uid already exists
    #[error("{kind} already exists (uid: {uid})")]
    IdentityConflict {
        /// Entity kind
        kind: EntityKind,
        /// Conflicting uid
        uid: String,
    },

    /// Strict mode: the referenced parent does not exist
    #[error("{kind} {uid} references missing parent {parent}\nCreate the parent first or open the storage with strict = false")]
    MissingParent {
        /// Kind of the child entity
        kind: EntityKind,
        /// Uid of the child entity
        uid: String,
        /// Missing parent reference
        parent: String,
    },

    /// A mutation targeted an entity the storage does not know
    #[error("{kind} not found (uid: {uid})")]
    NotFound {
        /// Entity kind
        kind: EntityKind,
        /// Requested uid
        uid: String,
    },

    /// The file lock could not be acquired in time
    #[error("Could not acquire lock {} within {waited:?}\nAnother process is holding the database; retry later", path.display())]
    ConcurrencyTimeout {
        /// Lock file path
        path: PathBuf,
        /// Time spent waiting
        waited: Duration,
    },

    /// Reload met two incomparable versions of the same uid
    #[error("Merge conflict on {uid}: {reason}. Please report this issue.")]
    MergeConflict {
        /// Conflicting uid
        uid: String,
        /// Why the versions cannot be ordered
        reason: String,
    },

    /// A uid is indexed but its object is missing
    #[error("Stale reference: {kind} {uid} is indexed but not stored")]
    StaleReference {
        /// Entity kind
        kind: EntityKind,
        /// Dangling uid
        uid: String,
    },

    /// Malformed query
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Bad configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The process released its locks to exit on a signal
    #[error("Storage is shutting down; the change was not committed\nThe lock was released for process exit")]
    ShuttingDown,

    /// Atomic rename of the staged snapshot failed
    #[error("Commit failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl Error {
    /// True for failures caused by lock contention rather than broken state
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::ConcurrencyTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_names() {
        assert_eq!(EntityKind::Project.as_str(), "project");
        assert_eq!(EntityKind::TrialGroup.as_str(), "trial_group");
        assert_eq!(EntityKind::Trial.to_string(), "trial");
    }

    #[test]
    fn test_timeout_detection() {
        let err = Error::ConcurrencyTimeout {
            path: PathBuf::from("db.json.lock"),
            waited: Duration::from_secs(1),
        };
        assert!(err.is_timeout());
        assert!(!Error::InvalidInput("x".into()).is_timeout());
    }
}
