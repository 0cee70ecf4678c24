//! Error types for the federated search core.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of failure classes surfaced by the federation layer.
///
/// Per-repo backend failures arrive tagged with one of the first four kinds;
/// the cohort kinds are raised by the coordinator itself before any fanout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "NO_INDEX")]
    NoIndex,
    #[serde(rename = "INTERNAL")]
    Internal,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "ERR_FEDERATED_MULTI_COHORT")]
    MultiCohort,
    #[serde(rename = "ERR_FEDERATED_COHORT_NOT_FOUND")]
    CohortNotFound,
    #[serde(rename = "ERR_FEDERATED_INVALID_COHORT_SELECTOR")]
    InvalidCohortSelector,
}

impl ErrorKind {
    /// Stable wire code for this kind.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NoIndex => "NO_INDEX",
            ErrorKind::Internal => "INTERNAL",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::MultiCohort => "ERR_FEDERATED_MULTI_COHORT",
            ErrorKind::CohortNotFound => "ERR_FEDERATED_COHORT_NOT_FOUND",
            ErrorKind::InvalidCohortSelector => "ERR_FEDERATED_INVALID_COHORT_SELECTOR",
        }
    }

    /// Parse a wire code. Unknown codes fall back to `Internal`.
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            "NO_INDEX" => ErrorKind::NoIndex,
            "CANCELLED" | "ERR_ABORTED" => ErrorKind::Cancelled,
            "INVALID_REQUEST" => ErrorKind::InvalidRequest,
            "ERR_FEDERATED_MULTI_COHORT" => ErrorKind::MultiCohort,
            "ERR_FEDERATED_COHORT_NOT_FOUND" => ErrorKind::CohortNotFound,
            "ERR_FEDERATED_INVALID_COHORT_SELECTOR" => ErrorKind::InvalidCohortSelector,
            _ => ErrorKind::Internal,
        }
    }

    /// Soft failures are recorded per repo and do not fail a non-strict call.
    pub fn is_soft(self) -> bool {
        matches!(self, ErrorKind::NoIndex)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Top-level error for the federation core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FederationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FederationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn no_index(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoIndex, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Federated search was cancelled.")
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn invalid_selector(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCohortSelector, message)
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

impl From<rusqlite::Error> for FederationError {
    fn from(err: rusqlite::Error) -> Self {
        FederationError::internal(format!("SQLite error: {err}"))
    }
}

impl From<serde_json::Error> for FederationError {
    fn from(err: serde_json::Error) -> Self {
        FederationError::internal(format!("JSON error: {err}"))
    }
}

impl From<std::io::Error> for FederationError {
    fn from(err: std::io::Error) -> Self {
        FederationError::internal(format!("IO error: {err}"))
    }
}

#[cfg(feature = "python")]
impl From<FederationError> for pyo3::PyErr {
    fn from(err: FederationError) -> pyo3::PyErr {
        use pyo3::exceptions::{PyInterruptedError, PyRuntimeError, PyValueError};
        let text = format!("{}: {}", err.code(), err.message);
        match err.kind {
            ErrorKind::InvalidRequest
            | ErrorKind::InvalidCohortSelector
            | ErrorKind::CohortNotFound
            | ErrorKind::MultiCohort => PyValueError::new_err(text),
            ErrorKind::Cancelled => PyInterruptedError::new_err(text),
            ErrorKind::NoIndex | ErrorKind::Internal => PyRuntimeError::new_err(text),
        }
    }
}

pub type FederationResult<T> = Result<T, FederationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_from_code() {
        for kind in [
            ErrorKind::NoIndex,
            ErrorKind::Internal,
            ErrorKind::Cancelled,
            ErrorKind::InvalidRequest,
            ErrorKind::MultiCohort,
            ErrorKind::CohortNotFound,
            ErrorKind::InvalidCohortSelector,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn unknown_code_is_internal() {
        assert_eq!(ErrorKind::from_code("EBUSY"), ErrorKind::Internal);
    }

    #[test]
    fn only_no_index_is_soft() {
        assert!(ErrorKind::NoIndex.is_soft());
        assert!(!ErrorKind::Internal.is_soft());
        assert!(!ErrorKind::Cancelled.is_soft());
    }

    #[test]
    fn display_includes_code() {
        let err = FederationError::no_index("missing");
        assert_eq!(err.to_string(), "NO_INDEX: missing");
    }
}
