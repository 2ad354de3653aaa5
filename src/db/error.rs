use crate::db::types::Conflict;

/// Errors surfaced by the review and commit engine.
///
/// Single-item operations return these directly. Multi-item operations
/// (changegroup commit, bulk) never let one item's error abort the batch;
/// per-item failures are folded into the aggregate report instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or empty proposal input. Rejected before any record is
    /// created.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced changeset, changegroup, or entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// An attempted transition from a terminal or wrong state, e.g.
    /// committing a discarded changeset or approving an approved field.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Entity version mismatch at commit time. Carries the expected,
    /// current, and proposed versions for diagnostic display.
    #[error("version conflict: expected {expected:?}, current {current:?}", expected = .0.expected_value, current = .0.current_value)]
    Conflict(Conflict),

    /// Update changeset with no approved field changes. Treated as a skip,
    /// not a failure, by callers that commit many changesets.
    #[error("nothing to commit for changeset {0}")]
    NothingToCommit(String),

    #[error("failed to acquire database lock")]
    Lock,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Migration(#[from] rusqlite_migration::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    RowMapping(#[from] serde_rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn changeset_not_found(id: &str) -> Self {
        Error::NotFound { kind: "changeset", id: id.to_string() }
    }

    pub(crate) fn changegroup_not_found(id: &str) -> Self {
        Error::NotFound { kind: "changegroup", id: id.to_string() }
    }

    pub(crate) fn field_change_not_found(id: &str) -> Self {
        Error::NotFound { kind: "field change", id: id.to_string() }
    }
}
