//! The sweep engine: enumerates spool units, drives the decider over them,
//! and turns its decisions into scheduler submissions.
//!
//! The build phase (`build_cache`) visits every not-yet-cached unit once;
//! the process phase (`process_cache`) repeatedly re-fetches the set of
//! still-incomplete units from the cache and drives the decider until none
//! remain.

use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::cache::Cache;
use crate::cache::CompleteState;
use crate::config::Config;
use crate::decider;
use crate::decider::Decision;
use crate::decider::Mode;
use crate::decider::SubmitPlan;
use crate::scheduler::SchedulerAdapter;
use crate::scheduler::SubmitOutcome;
use crate::scheduler::SubmitRequest;
use crate::spool;
use crate::spool::JobArraySpec;
use crate::spool::SpoolError;
use crate::spool::Unit;
use crate::suite::Suite;

/// Options controlling how submissions are built, shared by both sweep
/// phases.
#[derive(Debug, Clone, Copy)]
pub struct SweepOptions {
    /// Pass `-sp 300` on every submission (the `-r` CLI flag).
    pub high_priority: bool,
    /// Build and log commands but never execute them (the `-n` CLI flag).
    pub dry_run: bool,
}

/// Bounds a sweep to a sub-range of units by base name, as named by the
/// `-S`/`-E` CLI flags.
#[derive(Debug, Clone, Default)]
pub struct SweepRange {
    /// Skip units until (and including) this base name is seen.
    pub start: Option<String>,
    /// Stop after this base name has been processed.
    pub end: Option<String>,
}

/// Runs the build phase: enumerates `spool_root`'s units in ascending
/// trailing-integer order and calls the decider once for every unit not
/// already present in the cache.
pub fn build_cache(
    spool_root: &Path,
    range: &SweepRange,
    options: SweepOptions,
    logs_dir: &Path,
    cache: &dyn Cache,
    scheduler: &dyn SchedulerAdapter,
    suite: &dyn Suite,
    config: &Config,
) -> Result<(), SpoolError> {
    std::fs::create_dir_all(logs_dir).map_err(|source| SpoolError::Io {
        path: logs_dir.to_path_buf(),
        source,
    })?;

    let units = spool::enumerate_units(spool_root)?;
    let mut started = range.start.is_none();

    for unit in &units {
        if !started {
            if range.start.as_deref() == Some(unit.name.as_str()) {
                started = true;
            } else {
                continue;
            }
        }

        let key = unit.path.to_string_lossy().into_owned();
        if cache.fetch(&key).ok().flatten().is_none() {
            spool::validate_unit_structure(unit)?;
            let decision = decider::decide(unit, Mode::Process, cache, scheduler, suite, config);
            apply_decision(unit, decision, options, logs_dir, scheduler, suite, config);
        }

        if range.end.as_deref() == Some(unit.name.as_str()) {
            break;
        }
    }

    Ok(())
}

/// Runs the process phase: repeatedly fetches every unit whose cached
/// `complete` field is `0` and calls the decider on each, until the fetch
/// returns nothing (every unit has reached a terminal state).
pub fn process_cache(
    logs_dir: &Path,
    cache: &dyn Cache,
    scheduler: &dyn SchedulerAdapter,
    suite: &dyn Suite,
    config: &Config,
    options: SweepOptions,
    units_by_path: impl Fn(&str) -> Option<Unit>,
) -> Result<(), SpoolError> {
    loop {
        let mut incomplete = cache
            .fetch_complete(CompleteState::Incomplete)
            .unwrap_or_default();
        incomplete.sort_by_key(|path| {
            let basename = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            spool::trailing_index(&basename)
        });

        if incomplete.is_empty() {
            return Ok(());
        }

        for path in incomplete {
            let Some(unit) = units_by_path(&path) else {
                tracing::warn!(path, "cached unit no longer resolves on disk, skipping");
                continue;
            };
            let decision = decider::decide(&unit, Mode::Process, cache, scheduler, suite, config);
            apply_decision(&unit, decision, options, logs_dir, scheduler, suite, config);
        }
    }
}

/// Turns a [`Decision::Submit`] into one or more scheduler calls; other
/// decisions are either no-ops from the sweep engine's point of view or
/// already logged by the decider itself. [`Decision::Sleep`] blocks the
/// calling thread, matching the synchronous, single-threaded control loop.
fn apply_decision(
    unit: &Unit,
    decision: Decision,
    options: SweepOptions,
    logs_dir: &Path,
    scheduler: &dyn SchedulerAdapter,
    suite: &dyn Suite,
    config: &Config,
) {
    match decision {
        Decision::Sleep { seconds } => {
            thread::sleep(Duration::from_secs(seconds));
        }
        Decision::Submit { plan } => match plan {
            SubmitPlan::WholeUnit => {
                submit_one(
                    unit,
                    spool::array_spec_for_unit(unit).unwrap_or(JobArraySpec::Range {
                        name: unit.name.clone(),
                        count: 1,
                    }),
                    whole_unit_input_token(unit),
                    options,
                    logs_dir,
                    scheduler,
                    suite,
                    config,
                );
            }
            SubmitPlan::Inputs(inputs) => {
                for input in inputs {
                    let spec = spool::array_spec_for_input(unit, &input);
                    let input_name = input
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    submit_one(unit, spec, input_name, options, logs_dir, scheduler, suite, config);
                }
            }
        },
        Decision::Skip | Decision::MarkedComplete | Decision::Abandoned => {}
    }
}

/// The literal input-file token used on the command line when a whole unit
/// is submitted as one job array: `$LSB_JOBINDEX` is expanded by the
/// scheduler at run time, not by the controller.
fn whole_unit_input_token(unit: &Unit) -> String {
    format!("{}-$LSB_JOBINDEX", unit.name)
}

/// Submits one job-array spec for `unit`, logging the outcome. `input_name`
/// is the token passed to the suite's [`Suite::action`] to build the
/// command that will run on the scheduler host.
fn submit_one(
    unit: &Unit,
    spec: JobArraySpec,
    input_name: String,
    options: SweepOptions,
    logs_dir: &Path,
    scheduler: &dyn SchedulerAdapter,
    suite: &dyn Suite,
    config: &Config,
) {
    let request = SubmitRequest {
        unit,
        spec: spec.clone(),
        command: suite.action(&unit.path, &input_name),
        wait: false,
        high_priority: options.high_priority,
        logs_dir,
        dry_run: options.dry_run,
    };

    match scheduler.submit(&request, config) {
        SubmitOutcome::Submitted(job_id) => {
            tracing::info!(unit = %unit.name, job_id, array = %spec.as_job_name(), "submitted");
        }
        SubmitOutcome::QueueClosed => {
            tracing::warn!(unit = %unit.name, array = %spec.as_job_name(), "queue closed, will retry");
        }
        SubmitOutcome::Transient { code, stderr } => {
            tracing::warn!(unit = %unit.name, array = %spec.as_job_name(), ?code, stderr, "transient submit failure, will retry");
        }
        SubmitOutcome::DryRun(command) => {
            tracing::info!(unit = %unit.name, command = %command.display(), "dry-run submit");
        }
    }
}
