//! Worker configuration

use std::{fmt, sync::Arc, time::Duration};

use futures::future::BoxFuture;

use crate::{store::BoxError, worker_id::WorkerId};

/// Default values applied by [`WorkerOptions::default`].
pub mod defaults {
    use std::time::Duration;

    /// Idle/backoff delay between job acquisition attempts.
    pub const POLL_INTERVAL: Duration = Duration::from_millis(2000);

    /// Consecutive acquisition failures tolerated before the worker gives up.
    pub const MAX_CONTIGUOUS_ERRORS: u32 = 10;

    /// Lower bound of the lease-recovery re-arm interval.
    pub const MIN_RESET_LOCKED_INTERVAL: Duration = Duration::from_secs(8 * 60);

    /// Upper bound of the lease-recovery re-arm interval.
    pub const MAX_RESET_LOCKED_INTERVAL: Duration = Duration::from_secs(10 * 60);

    /// The first lease-recovery pass fires at a uniformly random point below
    /// this cap, so a fleet of workers started together does not stampede
    /// the store.
    pub const RESET_LOCKED_FIRST_DELAY_CAP: Duration = Duration::from_secs(60);
}

/// Options recognized by a single worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Worker identity; generated randomly when absent.
    pub worker_id: Option<WorkerId>,

    /// Idle/backoff delay between job acquisition attempts.
    pub poll_interval: Duration,

    /// Consecutive acquisition failures after which the worker rejects its
    /// completion and stops.
    pub max_contiguous_errors: u32,

    /// Stamp leases with the worker's clock instead of the database clock.
    pub use_local_time: bool,

    /// Bounds of the uniformly random lease-recovery re-arm interval.
    /// `min` must be strictly below `max`.
    pub min_reset_locked_interval: Duration,
    pub max_reset_locked_interval: Duration,

    /// Jobs carrying any of these flags are skipped at acquisition time.
    pub forbidden_flags: Option<ForbiddenFlags>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval: defaults::POLL_INTERVAL,
            max_contiguous_errors: defaults::MAX_CONTIGUOUS_ERRORS,
            use_local_time: false,
            min_reset_locked_interval: defaults::MIN_RESET_LOCKED_INTERVAL,
            max_reset_locked_interval: defaults::MAX_RESET_LOCKED_INTERVAL,
            forbidden_flags: None,
        }
    }
}

type FlagsFn = dyn Fn() -> BoxFuture<'static, Result<Vec<String>, BoxError>> + Send + Sync;

/// The set of job flags to skip, either fixed or recomputed before every
/// acquisition attempt.
#[derive(Clone)]
pub enum ForbiddenFlags {
    /// A fixed list.
    Static(Vec<String>),
    /// A callable re-evaluated at the top of each loop iteration; the
    /// resolved list is passed verbatim to the store.
    Dynamic(Arc<FlagsFn>),
}

impl ForbiddenFlags {
    /// A fixed flag list.
    pub fn from_list<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ForbiddenFlags::Static(flags.into_iter().map(Into::into).collect())
    }

    /// A callable producing the flag list. Covers both synchronous and
    /// asynchronous producers; a synchronous one just returns immediately.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<String>, BoxError>> + Send + 'static,
    {
        ForbiddenFlags::Dynamic(Arc::new(move || Box::pin(f())))
    }

    /// Resolves to the concrete skip-list for one acquisition attempt.
    pub(crate) async fn resolve(&self) -> Result<Vec<String>, BoxError> {
        match self {
            ForbiddenFlags::Static(flags) => Ok(flags.clone()),
            ForbiddenFlags::Dynamic(f) => f().await,
        }
    }
}

impl fmt::Debug for ForbiddenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForbiddenFlags::Static(flags) => f.debug_tuple("Static").field(flags).finish(),
            ForbiddenFlags::Dynamic(_) => f.debug_tuple("Dynamic").field(&"..").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_the_defaults_bundle() {
        //* Given / When
        let options = WorkerOptions::default();

        //* Then
        assert!(options.worker_id.is_none());
        assert_eq!(options.poll_interval, defaults::POLL_INTERVAL);
        assert_eq!(options.max_contiguous_errors, defaults::MAX_CONTIGUOUS_ERRORS);
        assert!(!options.use_local_time);
        assert_eq!(
            options.min_reset_locked_interval,
            defaults::MIN_RESET_LOCKED_INTERVAL
        );
        assert_eq!(
            options.max_reset_locked_interval,
            defaults::MAX_RESET_LOCKED_INTERVAL
        );
        assert!(options.forbidden_flags.is_none());
    }

    #[tokio::test]
    async fn static_flags_resolve_to_the_given_list() {
        //* Given
        let flags = ForbiddenFlags::from_list(["a", "b"]);

        //* When
        let resolved = flags.resolve().await.expect("resolution should succeed");

        //* Then
        assert_eq!(resolved, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn dynamic_flags_resolve_through_the_callable() {
        //* Given
        let flags = ForbiddenFlags::from_fn(|| async { Ok(vec!["tenant:1".to_string()]) });

        //* When
        let resolved = flags.resolve().await.expect("resolution should succeed");

        //* Then
        assert_eq!(resolved, vec!["tenant:1".to_string()]);
    }

    #[tokio::test]
    async fn dynamic_flags_surface_the_callable_error() {
        //* Given
        let flags = ForbiddenFlags::from_fn(|| async {
            Err::<Vec<String>, _>("flag service unavailable".into())
        });

        //* When
        let resolved = flags.resolve().await;

        //* Then
        let err = resolved.expect_err("resolution should fail");
        assert_eq!(err.to_string(), "flag service unavailable");
    }
}
