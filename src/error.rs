//! Top-level error type composed from every component's error kind.

use thiserror::Error;

use crate::cache::CacheError;
use crate::cli::CliError;
use crate::config::ConfigError;
use crate::scheduler::SchedulerError;
use crate::spool::SpoolError;
use crate::suite::SuiteError;

/// Errors that can terminate a `spoolctl` invocation.
///
/// Each variant corresponds to one of the error kinds in the design: a
/// structural spool error and a filesystem error are both fatal to the
/// current argument; a configuration error is fatal at startup. Scheduler
/// transient errors and queue-closed responses are intentionally absent
/// here - the decider handles those by retrying on the next sweep, they
/// never reach the top level.
#[derive(Debug, Error)]
pub enum AppError {
    /// The configuration file failed to load or validate.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The spool tree has an unexpected layout.
    #[error(transparent)]
    Spool(#[from] SpoolError),

    /// The completion cache could not be opened or queried.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The named suite could not be resolved or is missing a contract method.
    #[error(transparent)]
    Suite(#[from] SuiteError),

    /// A scheduler invocation failed in a way that isn't retryable.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Could not create the logs directory, open the log file, or change
    /// into a unit's working directory.
    #[error("filesystem error: {0}")]
    Filesystem(#[source] std::io::Error),

    /// The CLI arguments did not satisfy the invocation-level constraints
    /// (at most one action flag, uniform file-or-directory arguments).
    #[error(transparent)]
    Cli(#[from] CliError),
}

/// Result type used throughout `spoolctl`.
pub type Result<T> = std::result::Result<T, AppError>;
