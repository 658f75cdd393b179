use thiserror::Error;

/// The error taxonomy used across the ingestion → rule → alert → notification
/// pipeline. Boundary code (ingestion adapters, the future REST surface)
/// converts these into the appropriate external form; internal code passes
/// them through with `?` and keeps the kind intact.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Transient(_) | PipelineError::Conflict(_))
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        PipelineError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        PipelineError::Permanent(err.into())
    }
}

/// `rusqlite` errors are schema/constraint failures in practice for this
/// crate (the control-plane store has no network hop) — treat them as
/// `Permanent` unless the message indicates the db is locked/busy, which is
/// the one transient case SQLite itself exposes.
impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
            {
                return PipelineError::Transient(err.into());
            }
        }
        PipelineError::Permanent(err.into())
    }
}

impl From<clickhouse::error::Error> for PipelineError {
    fn from(err: clickhouse::error::Error) -> Self {
        PipelineError::Transient(err.into())
    }
}

/// A malformed JSON blob in a control-plane column is a data-integrity bug,
/// not something the caller can retry past.
impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Permanent(err.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
