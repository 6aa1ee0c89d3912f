use thiserror::Error;

/// Error taxonomy for the orchestration core.
///
/// `Validation` and `Conflict` never cause a state write. `Data` rewrites
/// the triggering update to `FAILED` and feeds the failure policy. `Transient`
/// is retried by the caller's outer retry loop. `Fatal` fails the owning job
/// outright.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Whether the update loop should retry the enclosing transaction.
    pub fn is_transient(&self) -> bool {
        matches!(self, OrchestratorError::Transient(_))
            || matches!(self, OrchestratorError::Database(e) if is_transient_db_error(e))
    }
}

fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            // Postgres deadlock_detected = 40P01, serialization_failure = 40001
            matches!(db_err.code().as_deref(), Some("40P01") | Some("40001"))
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
