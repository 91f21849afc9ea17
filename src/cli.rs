//! The CLI front-end: flag parsing and the invocation-level validation that
//! must happen before any spool-tree I/O.

use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use crate::sweep::SweepRange;

/// Errors raised while parsing or validating the command line, before any
/// component that touches the spool tree runs.
#[derive(Debug, Error)]
pub enum CliError {
    /// More than one action flag (`-b`, `-c`, `-p`, `-s`, `-v`, `-w`) was
    /// given.
    #[error("at most one action flag may be given; got: {0:?}")]
    MultipleActions(Vec<&'static str>),

    /// No action flag was given.
    #[error("no action flag given; specify one of -b, -c, -p, -s, -v, -w")]
    NoAction,

    /// The positional arguments mix files and directories.
    #[error("arguments must be uniformly files or uniformly directories")]
    MixedArguments,

    /// `-E` was given without exactly one directory argument.
    #[error("-E requires exactly one spool directory argument")]
    EndRequiresSingleDirectory,

    /// A positional argument could not be canonicalized (it likely doesn't
    /// exist).
    #[error("failed to resolve path `{path}`: {source}")]
    Canonicalize {
        /// The offending argument.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// The single selected action for this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// `-b`: populate the cache, submitting as the policy allows.
    BuildOnly,
    /// `-c`: report the running-job count for the argument.
    Count,
    /// `-p`: build the cache, then sweep until every unit is terminal.
    Process,
    /// `-s`: a single decider pass with no looping.
    SingleShot,
    /// `-v`: read-only filesystem validation.
    Validate,
    /// `-w`: wait for running jobs to drain.
    Wait,
}

/// Command-line flags, matching the external interface's flag table
/// exactly.
#[derive(Parser, Debug)]
#[command(name = "spoolctl", version, about = "Drives spool directories through an LSF-family batch scheduler")]
pub struct Cli {
    /// Configuration file path.
    #[arg(short = 'C', value_name = "PATH")]
    pub config: PathBuf,

    /// Build-only sweep: populates the cache; may still submit unless -n.
    #[arg(short = 'b')]
    pub build_only: bool,

    /// Report running-job count for the argument.
    #[arg(short = 'c')]
    pub count: bool,

    /// Debug logging.
    #[arg(short = 'd')]
    pub debug: bool,

    /// End the sweep after this unit (requires a single spool-dir
    /// argument).
    #[arg(short = 'E', value_name = "SUBDIR")]
    pub end: Option<String>,

    /// Cache file path override.
    #[arg(short = 'i', value_name = "PATH")]
    pub cache: Option<PathBuf>,

    /// Log file path override.
    #[arg(short = 'l', value_name = "PATH")]
    pub logfile: Option<PathBuf>,

    /// Dry-run: log the submit command, do not execute.
    #[arg(short = 'n')]
    pub dry_run: bool,

    /// Full process: build cache + sweep until terminal.
    #[arg(short = 'p')]
    pub process: bool,

    /// Resubmit with high priority (`-sp 300`).
    #[arg(short = 'r')]
    pub high_priority: bool,

    /// Single-shot submit.
    #[arg(short = 's')]
    pub single_shot: bool,

    /// Start the sweep at this unit.
    #[arg(short = 'S', value_name = "SUBDIR")]
    pub start: Option<String>,

    /// Validate only.
    #[arg(short = 'v')]
    pub validate: bool,

    /// Wait for running jobs to drain.
    #[arg(short = 'w')]
    pub wait: bool,

    /// Spool directories or spool-unit files to act on.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

impl Cli {
    /// Resolves the single selected action, rejecting zero or multiple
    /// action flags.
    pub fn action(&self) -> Result<Action, CliError> {
        let flags: Vec<(&'static str, bool)> = vec![
            ("-b", self.build_only),
            ("-c", self.count),
            ("-p", self.process),
            ("-s", self.single_shot),
            ("-v", self.validate),
            ("-w", self.wait),
        ];

        let selected: Vec<&'static str> = flags
            .iter()
            .filter(|(_, set)| *set)
            .map(|(name, _)| *name)
            .collect();

        match selected.len() {
            0 => Err(CliError::NoAction),
            1 => Ok(match selected[0] {
                "-b" => Action::BuildOnly,
                "-c" => Action::Count,
                "-p" => Action::Process,
                "-s" => Action::SingleShot,
                "-v" => Action::Validate,
                "-w" => Action::Wait,
                _ => unreachable!(),
            }),
            _ => Err(CliError::MultipleActions(selected)),
        }
    }

    /// Canonicalizes every positional argument and checks that they are
    /// uniformly files or uniformly directories.
    pub fn canonical_paths(&self) -> Result<Vec<PathBuf>, CliError> {
        let mut resolved = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let canonical = path
                .canonicalize()
                .map_err(|source| CliError::Canonicalize {
                    path: path.clone(),
                    source,
                })?;
            resolved.push(canonical);
        }

        let all_files = resolved.iter().all(|p| p.is_file());
        let all_dirs = resolved.iter().all(|p| p.is_dir());
        if !all_files && !all_dirs {
            return Err(CliError::MixedArguments);
        }

        if self.end.is_some() && (resolved.len() != 1 || !resolved[0].is_dir()) {
            return Err(CliError::EndRequiresSingleDirectory);
        }

        Ok(resolved)
    }

    /// Builds the [`SweepRange`] implied by `-S`/`-E`.
    pub fn sweep_range(&self) -> SweepRange {
        SweepRange {
            start: self.start.clone(),
            end: self.end.clone(),
        }
    }

    /// The cache file path: the `-i` override, or `<spoolroot>.cache`
    /// beside the first given path.
    pub fn cache_path(&self, spool_root: &Path) -> PathBuf {
        self.cache.clone().unwrap_or_else(|| {
            let mut path = spool_root.as_os_str().to_owned();
            path.push(".cache");
            PathBuf::from(path)
        })
    }

    /// The logs directory: always `<spoolroot>.logs` beside the spool
    /// root, regardless of `-i`/`-l` overrides (those apply to the cache
    /// and the diagnostic log, not to per-job output capture).
    pub fn logs_dir(&self, spool_root: &Path) -> PathBuf {
        let mut path = spool_root.as_os_str().to_owned();
        path.push(".logs");
        PathBuf::from(path)
    }
}
