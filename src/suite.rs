//! The suite contract: the pluggable interface between the controller and
//! the workload it drives, plus the startup-time registry that resolves a
//! configured suite name to an implementation.

use std::path::Path;

use thiserror::Error;

/// Errors raised while resolving a suite at startup.
#[derive(Debug, Error)]
pub enum SuiteError {
    /// The configured suite name has no registered implementation.
    #[error("unknown suite `{0}`")]
    Unknown(String),
}

/// The two operations a suite must provide.
///
/// Implementations must be deterministic and side-effect-free for
/// [`Suite::is_complete`]; it is called repeatedly by the decider and must
/// never itself mutate the filesystem.
pub trait Suite: Send + Sync + std::fmt::Debug {
    /// Builds the shell command that will be executed on the scheduler host
    /// to produce `<input_name>-output` under `/tmp`.
    fn action(&self, unit_dir: &Path, input_name: &str) -> String;

    /// Decides whether the output file beside `input_path` is a valid
    /// completion.
    fn is_complete(&self, input_path: &Path) -> bool;
}

/// A reference suite used for demonstrations and integration tests: it
/// copies the input file to `<input>-output` under `/tmp`, and considers an
/// input complete once a non-empty output file exists beside it.
#[derive(Debug, Default)]
pub struct CopySuite;

impl Suite for CopySuite {
    fn action(&self, unit_dir: &Path, input_name: &str) -> String {
        let input_path = unit_dir.join(input_name);
        format!(
            "cp {input} /tmp/{input_name}-output",
            input = input_path.display()
        )
    }

    fn is_complete(&self, input_path: &Path) -> bool {
        let output_path = input_path.with_file_name(format!(
            "{}-output",
            input_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));

        match std::fs::metadata(&output_path) {
            Ok(metadata) => metadata.is_file() && metadata.len() > 0,
            Err(_) => false,
        }
    }
}

/// Resolves a suite by name.
///
/// Unlike a reflective "can this object respond to this message" check,
/// failure here is a static, startup-time configuration error: a suite
/// missing either contract operation simply cannot be expressed by the
/// [`Suite`] trait, so resolution either yields a fully-conforming suite or
/// an error naming the unknown suite.
pub fn resolve(name: &str) -> Result<Box<dyn Suite>, SuiteError> {
    match name {
        "copy" => Ok(Box::new(CopySuite)),
        other => Err(SuiteError::Unknown(other.to_string())),
    }
}
