use thiserror::Error;

/// Error type for queue store operations that callers can act on
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store could not be reached (pool exhausted, socket or TLS failure)
    #[error("Queue store unavailable: {0}")]
    Connection(#[source] anyhow::Error),

    /// Unique constraint violation, e.g. a message reference that already exists
    #[error("Unique constraint violation")]
    UniqueViolation { constraint: Option<String>, message: String },

    /// A stored value could not be mapped onto the domain model
    #[error("Corrupt queue row: {0}")]
    Corrupt(String),

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_connection(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

/// Convert from sqlx::Error, separating connectivity failures from everything else
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(anyhow::Error::from(err)),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::UniqueViolation {
                constraint: db_err.constraint().map(|s| s.to_string()),
                message: db_err.message().to_string(),
            },
            _ => StoreError::Other(anyhow::Error::from(err)),
        }
    }
}

/// Type alias for queue store results
pub type Result<T> = std::result::Result<T, StoreError>;
