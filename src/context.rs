//! The logging and diagnostics context: an explicitly-threaded object
//! carrying the debug flag and a per-invocation run id, in place of the
//! module-level mutable logger state the design notes call out for
//! replacement.

use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use uuid::Uuid;

/// Where log records are written.
#[derive(Debug, Clone)]
pub enum LogSink {
    /// The process's standard output.
    Stdout,
    /// A file, named by `-l` or the config's `logfile` key.
    File(PathBuf),
}

/// Carries the run id, debug flag, and log sink through every component
/// that needs them, rather than reaching them via a singleton.
#[derive(Debug, Clone)]
pub struct Context {
    /// A fresh id generated once per invocation, attached to every log
    /// record so concurrent runs against the same spool tree (however
    /// discouraged) can be told apart after the fact.
    pub run_id: Uuid,
    /// Whether per-step decider tracing is emitted.
    pub debug: bool,
    /// Where log records go.
    pub sink: LogSink,
}

impl Context {
    /// Builds a context for this invocation and initializes the global
    /// `tracing` subscriber to match it.
    ///
    /// Returns an error if the log file named by `logfile` cannot be opened
    /// for appending.
    pub fn init(debug: bool, logfile: Option<&Path>) -> std::io::Result<Self> {
        let run_id = Uuid::new_v4();
        let sink = match logfile {
            Some(path) => LogSink::File(path.to_path_buf()),
            None => LogSink::Stdout,
        };

        let default_directive = if debug { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));

        match &sink {
            LogSink::Stdout => {
                fmt().with_env_filter(filter).with_target(false).init();
            }
            LogSink::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_writer(move || -> File {
                        file.try_clone().expect("failed to clone log file handle")
                    })
                    .init();
            }
        }

        Ok(Context {
            run_id,
            debug,
            sink,
        })
    }

    /// Emits a debug-level record, only visible when [`Context::debug`] is
    /// set (via the `EnvFilter` configured in [`Context::init`]).
    pub fn trace_step(&self, unit: &str, step: &str) {
        tracing::debug!(run_id = %self.run_id, unit, step, "decider step");
    }
}
