//! Error types for queue database operations

use crate::conn::ConnError;

/// Errors that can occur when interacting with the queue database.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to establish connection to the queue database.
    ///
    /// This error is considered retryable. See `is_connection_error()`.
    #[error("Error connecting to queue db: {0}")]
    Connection(#[source] sqlx::Error),

    /// Failed to run database migrations.
    ///
    /// Migration failures are usually fatal and require manual intervention.
    #[error("Error running migrations: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Database query execution failed.
    #[error("Error executing database query: {0}")]
    Database(#[source] sqlx::Error),
}

impl Error {
    /// Returns `true` if the error is likely to be a transient connection issue.
    ///
    /// This is used to determine if an operation should be retried. Other
    /// database errors, such as constraint violations, are not considered
    /// transient and will not be retried.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(_) => true,
            Error::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

impl From<ConnError> for Error {
    fn from(err: ConnError) -> Self {
        match err {
            ConnError::ConnectionError(err) => Error::Connection(err),
            ConnError::MigrationFailed(err) => Error::Migration(err),
        }
    }
}
