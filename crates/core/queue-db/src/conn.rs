//! Internal connection pool implementation

use std::time::Duration;

use sqlx::{
    Pool, Postgres,
    migrate::{MigrateError, Migrator},
    postgres::PgPoolOptions,
};

/// A connection pool to the queue DB.
#[derive(Debug, Clone)]
pub(crate) struct ConnPool(Pool<Postgres>);

impl ConnPool {
    /// Creates a connection pool with the specified size and 5-second acquire timeout.
    #[tracing::instrument(skip_all, err)]
    pub(crate) async fn connect(url: &str, pool_size: u32) -> Result<Self, ConnError> {
        PgPoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map(Self)
            .map_err(ConnError::ConnectionError)
    }

    /// Runs migrations on the database.
    ///
    /// SQLx does the right things:
    /// - Locks the DB before running migrations.
    /// - Never runs the same migration twice.
    /// - Errors on changes to old migrations.
    #[tracing::instrument(skip(self), err)]
    pub(crate) async fn run_migrations(&self) -> Result<(), ConnError> {
        static MIGRATOR: Migrator = sqlx::migrate!();
        MIGRATOR
            .run(&self.0)
            .await
            .map_err(ConnError::MigrationFailed)
    }
}

impl std::ops::Deref for ConnPool {
    type Target = Pool<Postgres>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Errors that can occur when connecting to the queue DB.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Failed to establish database connection.
    #[error("Error connecting to queue db: {0}")]
    ConnectionError(#[source] sqlx::Error),

    /// Failed to run database migrations.
    #[error("Error running migrations: {0}")]
    MigrationFailed(#[source] MigrateError),
}
