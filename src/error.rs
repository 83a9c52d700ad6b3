//! Crate-level error type.
//!
//! Every fallible operation in the ledger, registry, gateway and CLI returns
//! [`LabError`]. Callers branch on [`LabError::kind`] rather than matching on
//! message text.

use thiserror::Error;

use crate::model::ExperimentState;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LabError>;

/// Errors surfaced by the experiment engine.
#[derive(Debug, Error)]
pub enum LabError {
    /// Malformed experiment definition (too few variants, bad weights, bad name,
    /// or an undecodable stored definition).
    #[error("invalid experiment definition: {0}")]
    InvalidDefinition(String),

    /// Explicit create on a name that is already taken.
    #[error("experiment '{0}' already exists")]
    AlreadyExists(String),

    /// Lookup of an experiment that does not exist.
    #[error("experiment '{0}' not found")]
    NotFound(String),

    /// Ingestion report referencing an experiment that cannot be resolved or
    /// implicitly created.
    #[error("unknown experiment '{0}'")]
    UnknownExperiment(String),

    /// Variant index outside `[0, variant_count)`.
    #[error("variant {index} out of range for '{experiment}' (has {count} variants)")]
    InvalidVariant {
        experiment: String,
        index: i64,
        count: usize,
    },

    /// State-transition precondition violated.
    #[error("experiment '{experiment}' is {state}, expected running")]
    InvalidState {
        experiment: String,
        state: ExperimentState,
    },

    /// Inbound report failed basic validation (missing fields, bad event kind,
    /// undecodable payload).
    #[error("invalid report: {0}")]
    InvalidReport(String),

    /// Underlying store failure.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] rusqlite::Error),
}

/// Plain tag for [`LabError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidDefinition,
    AlreadyExists,
    NotFound,
    UnknownExperiment,
    InvalidVariant,
    InvalidState,
    InvalidReport,
    StorageUnavailable,
}

impl ErrorKind {
    /// `true` when the caller supplied bad input; retrying the same request
    /// will fail the same way.
    pub fn is_client_error(self) -> bool {
        !matches!(self, ErrorKind::StorageUnavailable)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidDefinition => "invalid_definition",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UnknownExperiment => "unknown_experiment",
            ErrorKind::InvalidVariant => "invalid_variant",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::InvalidReport => "invalid_report",
            ErrorKind::StorageUnavailable => "storage_unavailable",
        };
        f.write_str(s)
    }
}

impl LabError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LabError::InvalidDefinition(_) => ErrorKind::InvalidDefinition,
            LabError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            LabError::NotFound(_) => ErrorKind::NotFound,
            LabError::UnknownExperiment(_) => ErrorKind::UnknownExperiment,
            LabError::InvalidVariant { .. } => ErrorKind::InvalidVariant,
            LabError::InvalidState { .. } => ErrorKind::InvalidState,
            LabError::InvalidReport(_) => ErrorKind::InvalidReport,
            LabError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
        }
    }
}

impl From<rusqlite::Error> for LabError {
    fn from(e: rusqlite::Error) -> Self {
        LabError::StorageUnavailable(e)
    }
}

/// Returns `true` if `err` is a SQLite UNIQUE / PRIMARY KEY violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            code.code == rusqlite::ErrorCode::ConstraintViolation
                && matches!(
                    code.extended_code,
                    rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                )
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_maps_each_variant() {
        assert_eq!(LabError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            LabError::InvalidVariant { experiment: "x".into(), index: 3, count: 2 }.kind(),
            ErrorKind::InvalidVariant
        );
        assert_eq!(
            LabError::InvalidState { experiment: "x".into(), state: ExperimentState::Completed }
                .kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_only_storage_is_server_side() {
        assert!(ErrorKind::AlreadyExists.is_client_error());
        assert!(ErrorKind::InvalidReport.is_client_error());
        assert!(!ErrorKind::StorageUnavailable.is_client_error());
    }

    #[test]
    fn test_display_mentions_experiment() {
        let e = LabError::InvalidVariant { experiment: "hero".into(), index: 5, count: 2 };
        let msg = e.to_string();
        assert!(msg.contains("hero"));
        assert!(msg.contains('5'));
    }

    #[test]
    fn test_unique_violation_detection_ignores_other_errors() {
        assert!(!is_unique_violation(&rusqlite::Error::QueryReturnedNoRows));
    }

    #[test]
    fn test_unique_violation_detected_from_real_insert() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k TEXT UNIQUE)").unwrap();
        conn.execute("INSERT INTO t (k) VALUES ('a')", []).unwrap();
        let err = conn.execute("INSERT INTO t (k) VALUES ('a')", []).unwrap_err();
        assert!(is_unique_violation(&err));
    }
}
