//! Implementation of the configuration module.
//!
//! Mirrors the YAML key table from the design doc exactly: required keys
//! are required fields, optional keys are `Option`-typed. `deny_unknown_fields`
//! turns a typo'd key into the same fatal startup error as a missing one.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        /// The path that was read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file could not be parsed as YAML, or a required key is
    /// missing, or an unknown key is present.
    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        /// The path that was parsed.
        path: PathBuf,
        /// The underlying YAML error.
        #[source]
        source: serde_yaml_ng::Error,
    },

    /// The configuration parsed but failed a semantic validation check.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Suite selection and suite-defined parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    /// The name of the suite, looked up in the suite registry.
    pub name: String,
    /// Free-form, suite-defined parameters.
    #[serde(default)]
    pub parameters: String,
}

/// The `spoolctl` configuration, loaded from the YAML file named by `-C`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The LSF queue to submit to and query.
    pub queue: String,
    /// Seconds to sleep in the churn guard and the queue-full wait loop.
    pub sleepval: u64,
    /// Queue depth above which submission pauses.
    pub queueceiling: i64,
    /// Queue depth below which submission resumes.
    pub queuefloor: i64,
    /// Seconds within which a unit is not re-examined (churn avoidance).
    pub churnrate: i64,
    /// Maximum submissions per unit before it is abandoned. `0` means
    /// infinite.
    pub lsf_tries: u32,
    /// Maximum cache-operation retries (not used by the control loop
    /// directly, but part of the required key set).
    pub db_tries: u32,
    /// Suite selection.
    pub suite: SuiteConfig,
    /// LSF user to query with `bjobs -u` for queue depth, if set.
    #[serde(default)]
    pub user: Option<String>,
    /// Email address passed to `bsub -u`.
    #[serde(default)]
    pub email: Option<String>,
    /// Free-form extra arguments appended to every `bsub` invocation.
    #[serde(default)]
    pub bsubargs: Option<String>,
    /// Sentinel file whose presence halts further submission.
    #[serde(default)]
    pub stopflag: Option<PathBuf>,
    /// Log file path; stdout is used when absent.
    #[serde(default)]
    pub logfile: Option<PathBuf>,
}

impl Config {
    /// Reads and parses a configuration file from the specified path.
    pub fn read_config(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config =
            serde_yaml_ng::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validates semantic constraints that the type system can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queuefloor > self.queueceiling {
            return Err(ConfigError::Invalid(format!(
                "`queuefloor` ({}) must not exceed `queueceiling` ({})",
                self.queuefloor, self.queueceiling
            )));
        }

        if self.suite.name.is_empty() {
            return Err(ConfigError::Invalid(String::from(
                "`suite.name` must not be empty",
            )));
        }

        Ok(())
    }
}
