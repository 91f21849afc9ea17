//! The scheduler adapter: builds and runs `bsub`/`bqueues`/`bjobs`
//! invocations and parses their textual output into typed results.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;

use regex::Regex;
use thiserror::Error;

use crate::config::Config;
use crate::spool::JobArraySpec;
use crate::spool::Unit;

/// Errors raised while invoking the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler binary could not be spawned.
    #[error("failed to run `{binary}`: {source}")]
    Spawn {
        /// The binary that failed to spawn.
        binary: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The scheduler's output could not be parsed into the expected shape.
    #[error("unexpected output from `{binary}`: {detail}")]
    UnexpectedOutput {
        /// The binary whose output was unexpected.
        binary: String,
        /// A human-readable description of what went wrong.
        detail: String,
    },
}

/// The outcome of a `bsub` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The job was accepted; carries the LSF job id.
    Submitted(u64),
    /// `bsub` exited 255: the queue is closed. Retry on the next sweep.
    QueueClosed,
    /// `bsub` exited non-zero (and not 255): a transient failure. Retry on
    /// the next sweep.
    Transient {
        /// The exit code, if the process actually ran to completion.
        code: Option<i32>,
        /// Captured stderr, for diagnostics.
        stderr: String,
    },
    /// Dry-run: the command was built and logged, never spawned.
    DryRun(BsubCommand),
}

/// The result of a queue depth query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDepth {
    /// A parsed job count.
    Known(i64),
    /// The output could not be parsed into a job count.
    Unknown,
}

/// A fully-built `bsub` invocation, kept as data so it can be logged
/// (dry-run) or executed without duplicating the construction logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BsubCommand {
    /// The submit binary, always `bsub`.
    pub binary: String,
    /// The argument list, in the order specified by the design doc.
    pub args: Vec<String>,
    /// The working directory `bsub` is launched from.
    pub cwd: PathBuf,
}

impl BsubCommand {
    /// Renders the command the way it would appear on a shell command line,
    /// for dry-run logging.
    pub fn display(&self) -> String {
        let mut parts = vec![self.binary.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// A request to submit one job array (either a whole unit, or a single
/// incomplete input within a unit).
pub struct SubmitRequest<'a> {
    /// The unit being submitted.
    pub unit: &'a Unit,
    /// The job-array spec: either the whole unit or one input file.
    pub spec: JobArraySpec,
    /// The suite-supplied command to execute on the scheduler host.
    pub command: String,
    /// Whether to pass `-K` (block until the job completes).
    pub wait: bool,
    /// Whether to pass `-sp 300` (high priority resubmission).
    pub high_priority: bool,
    /// The logs directory (`<spoolroot>.logs`) that `-e`/`-o` paths are
    /// rooted under.
    pub logs_dir: &'a Path,
    /// When set, the command is built and logged but never spawned.
    pub dry_run: bool,
}

/// Builds the `bsub` command for a submission request, following the
/// fragment order from the design doc exactly.
pub fn build_bsub_command(request: &SubmitRequest<'_>, config: &Config) -> BsubCommand {
    let mut args = Vec::new();

    if request.wait {
        args.push("-K".to_string());
    }
    if request.high_priority {
        args.push("-sp".to_string());
        args.push("300".to_string());
    }
    if let Some(email) = &config.email {
        args.push("-u".to_string());
        args.push(email.clone());
    }
    if let Some(extra) = &config.bsubargs {
        args.extend(extra.split_whitespace().map(str::to_string));
    }
    args.push("-q".to_string());
    args.push(config.queue.clone());
    args.push("-J".to_string());
    args.push(request.spec.as_job_name());

    let post_exec = format!(
        "mv /tmp/{unit}-${{LSB_JOBINDEX}}-output {dir} 2>/dev/null; true",
        unit = request.spec.unit_name(),
        dir = request.unit.path.display()
    );
    args.push("-Ep".to_string());
    args.push(post_exec);

    let log_stem = format!("{}.%I.%J", request.spec.as_job_name());
    args.push("-e".to_string());
    args.push(
        request
            .logs_dir
            .join(format!("{log_stem}.err"))
            .to_string_lossy()
            .into_owned(),
    );
    args.push("-o".to_string());
    args.push(
        request
            .logs_dir
            .join(format!("{log_stem}.out"))
            .to_string_lossy()
            .into_owned(),
    );

    args.push(request.command.clone());

    BsubCommand {
        binary: "bsub".to_string(),
        args,
        cwd: request.unit.path.clone(),
    }
}

/// Parses `bsub`'s stdout on success, extracting the job id from the first
/// line matching `<(\d+)>`.
fn parse_job_id(stdout: &str) -> Result<u64, SchedulerError> {
    let pattern = Regex::new(r"<(\d+)>").expect("job id pattern is valid");
    let line = stdout
        .lines()
        .next()
        .ok_or_else(|| SchedulerError::UnexpectedOutput {
            binary: "bsub".to_string(),
            detail: "empty output".to_string(),
        })?;

    let captures = pattern
        .captures(line)
        .ok_or_else(|| SchedulerError::UnexpectedOutput {
            binary: "bsub".to_string(),
            detail: format!("no job id in first line: {line:?}"),
        })?;

    captures[1]
        .parse()
        .map_err(|_| SchedulerError::UnexpectedOutput {
            binary: "bsub".to_string(),
            detail: format!("job id is not a number: {line:?}"),
        })
}

/// The scheduler adapter contract: implemented for real LSF binaries and
/// for a stub used in tests.
pub trait SchedulerAdapter: Send + Sync {
    /// Submits a job array, returning its outcome.
    fn submit(&self, request: &SubmitRequest<'_>, config: &Config) -> SubmitOutcome;

    /// Counts jobs currently running (or pending) for the given job-array
    /// spec.
    fn running_count(&self, spec: &JobArraySpec, config: &Config) -> Result<u64, SchedulerError>;

    /// Queries the current queue depth.
    fn queue_depth(&self, config: &Config) -> Result<QueueDepth, SchedulerError>;
}

/// The real adapter: shells out to `bsub`, `bqueues`, and `bjobs`.
#[derive(Debug, Default)]
pub struct LsfAdapter;

impl SchedulerAdapter for LsfAdapter {
    fn submit(&self, request: &SubmitRequest<'_>, config: &Config) -> SubmitOutcome {
        let bsub = build_bsub_command(request, config);

        if request.dry_run {
            tracing::info!(command = %bsub.display(), "dry-run: would submit");
            return SubmitOutcome::DryRun(bsub);
        }

        let output = Command::new(&bsub.binary)
            .args(&bsub.args)
            .current_dir(&bsub.cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = match output {
            Ok(output) => output,
            Err(source) => {
                tracing::warn!(binary = %bsub.binary, error = %source, "failed to spawn bsub");
                return SubmitOutcome::Transient {
                    code: None,
                    stderr: source.to_string(),
                };
            }
        };

        match output.status.code() {
            Some(255) => SubmitOutcome::QueueClosed,
            Some(0) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                match parse_job_id(&stdout) {
                    Ok(id) => SubmitOutcome::Submitted(id),
                    Err(err) => SubmitOutcome::Transient {
                        code: Some(0),
                        stderr: err.to_string(),
                    },
                }
            }
            code => SubmitOutcome::Transient {
                code,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
        }
    }

    fn running_count(&self, spec: &JobArraySpec, _config: &Config) -> Result<u64, SchedulerError> {
        let output = Command::new("bjobs")
            .arg("-J")
            .arg(spec.unit_name())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| SchedulerError::Spawn {
                binary: "bjobs".to_string(),
                source,
            })?;

        if !output.status.success() {
            // No matching jobs is reported as a non-zero exit by `bjobs`.
            return Ok(0);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(count_job_lines(&stdout))
    }

    fn queue_depth(&self, config: &Config) -> Result<QueueDepth, SchedulerError> {
        if let Some(user) = &config.user {
            let output = Command::new("bjobs")
                .arg("-u")
                .arg(user)
                .arg("-q")
                .arg(&config.queue)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .map_err(|source| SchedulerError::Spawn {
                    binary: "bjobs".to_string(),
                    source,
                })?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(QueueDepth::Known(count_job_lines(&stdout) as i64))
        } else {
            let output = Command::new("bqueues")
                .arg(&config.queue)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .map_err(|source| SchedulerError::Spawn {
                    binary: "bqueues".to_string(),
                    source,
                })?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(parse_bqueues_depth(&stdout, &config.queue))
        }
    }
}

/// Counts data lines (lines after a `JOBID`-prefixed header) in `bjobs`
/// output.
fn count_job_lines(stdout: &str) -> u64 {
    let mut lines = stdout.lines();
    match lines.next() {
        Some(header) if header.trim_start().starts_with("JOBID") => lines.count() as u64,
        Some(_) | None => 0,
    }
}

/// Parses `bqueues <queue>` output, taking the 8th whitespace-separated
/// field on the line beginning with `<queue>`.
fn parse_bqueues_depth(stdout: &str, queue: &str) -> QueueDepth {
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() == Some(&queue) {
            return match fields.get(7).and_then(|f| f.parse::<i64>().ok()) {
                Some(count) => QueueDepth::Known(count),
                None => QueueDepth::Unknown,
            };
        }
    }
    QueueDepth::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_id_from_bsub_output() {
        let id = parse_job_id("Job <12345> is submitted to queue <normal>.\n").unwrap();
        assert_eq!(id, 12345);
    }

    #[test]
    fn parse_job_id_errors_on_unrecognized_output() {
        assert!(parse_job_id("no job id here\n").is_err());
    }

    #[test]
    fn counts_bjobs_data_lines() {
        let stdout = "JOBID   USER   STAT  QUEUE\n101   alice  RUN   normal\n102   alice  PEND  normal\n";
        assert_eq!(count_job_lines(stdout), 2);
    }

    #[test]
    fn no_header_means_zero_running() {
        assert_eq!(count_job_lines("No unfinished job found\n"), 0);
    }

    #[test]
    fn parses_bqueues_depth_for_matching_queue() {
        let stdout = "QUEUE_NAME  PRIO STATUS MAX JL/U JL/P JL/H NJOBS PEND RUN SUSP\n\
                      normal       30  Open   -   -    -    -    42    10   32  0\n";
        assert_eq!(parse_bqueues_depth(stdout, "normal"), QueueDepth::Known(42));
    }

    #[test]
    fn missing_queue_line_is_unknown() {
        let stdout = "QUEUE_NAME  PRIO STATUS MAX JL/U JL/P JL/H NJOBS PEND RUN SUSP\n\
                      other        30  Open   -   -    -    -    42    10   32  0\n";
        assert_eq!(parse_bqueues_depth(stdout, "normal"), QueueDepth::Unknown);
    }

    #[test]
    fn build_bsub_command_orders_fragments() {
        let unit = Unit {
            path: PathBuf::from("/spool/u"),
            name: "u".to_string(),
        };
        let config_yaml = r#"
queue: normal
sleepval: 30
queueceiling: 500
queuefloor: 400
churnrate: 60
lsf_tries: 3
db_tries: 3
suite:
  name: copy
email: ops@example.com
bsubargs: "-R rusage[mem=100]"
"#;
        let config: Config = serde_yaml_ng::from_str(config_yaml).unwrap();
        let logs_dir = PathBuf::from("/spool/.logs");
        let request = SubmitRequest {
            unit: &unit,
            spec: JobArraySpec::Range {
                name: "u".to_string(),
                count: 2,
            },
            command: "echo hi".to_string(),
            wait: true,
            high_priority: true,
            logs_dir: &logs_dir,
            dry_run: false,
        };

        let command = build_bsub_command(&request, &config);
        assert_eq!(command.binary, "bsub");
        assert_eq!(command.cwd, PathBuf::from("/spool/u"));

        let expected_prefix = vec![
            "-K",
            "-sp",
            "300",
            "-u",
            "ops@example.com",
            "-R",
            "rusage[mem=100]",
            "-q",
            "normal",
            "-J",
            "u[1-2]",
        ];
        assert_eq!(&command.args[..expected_prefix.len()], &expected_prefix[..]);
        assert_eq!(command.args.last().unwrap(), "echo hi");
    }

    #[test]
    fn dry_run_never_spawns_bsub() {
        let unit = Unit {
            path: PathBuf::from("/spool/u"),
            name: "u".to_string(),
        };
        let config: Config = serde_yaml_ng::from_str(
            r#"
queue: normal
sleepval: 30
queueceiling: 500
queuefloor: 400
churnrate: 60
lsf_tries: 3
db_tries: 3
suite:
  name: copy
"#,
        )
        .unwrap();
        let logs_dir = PathBuf::from("/spool/.logs");
        let request = SubmitRequest {
            unit: &unit,
            spec: JobArraySpec::Range {
                name: "u".to_string(),
                count: 1,
            },
            command: "echo hi".to_string(),
            wait: false,
            high_priority: false,
            logs_dir: &logs_dir,
            dry_run: true,
        };

        let adapter = LsfAdapter;
        match adapter.submit(&request, &config) {
            SubmitOutcome::DryRun(command) => assert_eq!(command.binary, "bsub"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
