//! `spoolctl`: a persistent controller that drives spool directories
//! through an LSF-family batch scheduler until every input has produced a
//! valid output.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod decider;
pub mod error;
pub mod scheduler;
pub mod spool;
pub mod suite;
pub mod sweep;
pub mod validate;

use std::path::Path;
use std::path::PathBuf;

use cache::Cache;
use cache::CompleteState;
use cache::SqliteCache;
use cli::Action;
use cli::Cli;
use config::Config;
use context::Context;
use error::AppError;
use error::Result;
use scheduler::LsfAdapter;
use scheduler::SchedulerAdapter;
use spool::Unit;
use sweep::SweepOptions;

/// Runs one `spoolctl` invocation end to end, returning the process exit
/// code the chosen action implies.
pub fn run(cli: Cli) -> Result<i32> {
    let action = cli.action()?;
    let paths = cli.canonical_paths()?;

    let config = Config::read_config(&cli.config)?;
    let suite = suite::resolve(&config.suite.name)?;

    let context = Context::init(cli.debug, cli.logfile.as_deref().or(config.logfile.as_deref()))
        .map_err(AppError::Filesystem)?;

    // Entering this span for the whole invocation attaches `run_id` to
    // every `tracing` event emitted below it, including the decider's and
    // sweep engine's per-step records and the `-p` summary (§3: the run
    // id must be "attached to every log line emitted during that
    // invocation and to the summary emitted at the end of `-p`").
    let span = tracing::info_span!("invocation", run_id = %context.run_id);
    let _entered = span.enter();

    let scheduler = LsfAdapter;
    let options = SweepOptions {
        high_priority: cli.high_priority,
        dry_run: cli.dry_run,
    };

    // Every action in the table names exactly one spool root; multiple
    // positional arguments are tolerated uniformly across actions that
    // support them (e.g. `-c`, `-w`) by looping over each in turn.
    let mut last_exit_code = 0;
    for spool_root in &paths {
        let logs_dir = cli.logs_dir(spool_root);
        context.trace_step(&spool_root.to_string_lossy(), "start");

        last_exit_code = match action {
            Action::BuildOnly => {
                let cache = SqliteCache::open(cli.cache_path(spool_root))?;
                cache.prep()?;
                run_build_only(spool_root, &cli, &cache, &scheduler, suite.as_ref(), &config, &logs_dir, options)?
            }
            Action::Process => {
                let cache = SqliteCache::open(cli.cache_path(spool_root))?;
                cache.prep()?;
                run_process(spool_root, &cli, &cache, &scheduler, suite.as_ref(), &config, &logs_dir, options)?
            }
            Action::SingleShot => {
                let cache = SqliteCache::open(cli.cache_path(spool_root))?;
                cache.prep()?;
                run_single_shot(spool_root, &cache, &scheduler, suite.as_ref(), &config, &logs_dir, options)?
            }
            Action::Validate => {
                // Per the validator's read-only contract, it only upserts
                // into a cache the operator explicitly named with `-i`; a
                // bare `-v` never creates or touches `<spoolroot>.cache`.
                let explicit_cache = cli
                    .cache
                    .as_ref()
                    .map(SqliteCache::open)
                    .transpose()?;
                if let Some(cache) = &explicit_cache {
                    cache.prep()?;
                }
                run_validate(spool_root, explicit_cache.as_ref().map(|c| c as &dyn Cache), suite.as_ref())?
            }
            Action::Count => run_count(spool_root, &scheduler, &config)?,
            Action::Wait => run_wait(spool_root, &scheduler, &config)?,
        };
    }

    context.trace_step("invocation", "done");
    Ok(last_exit_code)
}

/// `-b`: populate the cache for every unit not yet seen.
fn run_build_only(
    spool_root: &Path,
    cli: &Cli,
    cache: &dyn Cache,
    scheduler: &dyn SchedulerAdapter,
    suite: &dyn suite::Suite,
    config: &Config,
    logs_dir: &Path,
    options: SweepOptions,
) -> Result<i32> {
    sweep::build_cache(
        spool_root,
        &cli.sweep_range(),
        options,
        logs_dir,
        cache,
        scheduler,
        suite,
        config,
    )?;
    Ok(0)
}

/// `-p`: build the cache, then sweep until no unit remains at
/// `complete = 0`.
fn run_process(
    spool_root: &Path,
    cli: &Cli,
    cache: &dyn Cache,
    scheduler: &dyn SchedulerAdapter,
    suite: &dyn suite::Suite,
    config: &Config,
    logs_dir: &Path,
    options: SweepOptions,
) -> Result<i32> {
    sweep::build_cache(
        spool_root,
        &cli.sweep_range(),
        options,
        logs_dir,
        cache,
        scheduler,
        suite,
        config,
    )?;

    sweep::process_cache(
        logs_dir,
        cache,
        scheduler,
        suite,
        config,
        options,
        unit_from_cache_key,
    )?;

    let abandoned = cache.fetch_complete(CompleteState::Abandoned)?;
    if !abandoned.is_empty() {
        tracing::warn!(count = abandoned.len(), units = ?abandoned, "units abandoned after retry cap");
        return Ok(1);
    }

    Ok(0)
}

/// `-s`: one decider pass over every unit, no looping.
fn run_single_shot(
    spool_root: &Path,
    cache: &dyn Cache,
    scheduler: &dyn SchedulerAdapter,
    suite: &dyn suite::Suite,
    config: &Config,
    logs_dir: &Path,
    options: SweepOptions,
) -> Result<i32> {
    std::fs::create_dir_all(logs_dir).map_err(AppError::Filesystem)?;
    let units = spool::enumerate_units(spool_root)?;
    for unit in &units {
        spool::validate_unit_structure(unit)?;
        let decision = decider::decide(unit, decider::Mode::Process, cache, scheduler, suite, config);
        sweep_apply_for_single_shot(unit, decision, options, logs_dir, scheduler, suite, config);
    }
    Ok(0)
}

/// Applies one decider decision the way the sweep engine would, used by
/// the `-s` single-shot action which doesn't loop through [`sweep::process_cache`].
fn sweep_apply_for_single_shot(
    unit: &Unit,
    decision: decider::Decision,
    options: SweepOptions,
    logs_dir: &Path,
    scheduler: &dyn SchedulerAdapter,
    suite: &dyn suite::Suite,
    config: &Config,
) {
    // Single-shot submissions are synchronous (`-K`) since the action is
    // meant for interactive, one-off use rather than the unattended sweep.
    if let decider::Decision::Submit { plan } = decision {
        match plan {
            decider::SubmitPlan::WholeUnit => {
                if let Ok(spec) = spool::array_spec_for_unit(unit) {
                    let input_name = format!("{}-$LSB_JOBINDEX", unit.name);
                    submit_synchronously(unit, spec, input_name, options, logs_dir, scheduler, suite, config);
                }
            }
            decider::SubmitPlan::Inputs(inputs) => {
                for input in inputs {
                    let spec = spool::array_spec_for_input(unit, &input);
                    let input_name = input
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    submit_synchronously(unit, spec, input_name, options, logs_dir, scheduler, suite, config);
                }
            }
        }
    }
}

/// Submits one job-array spec with `-K` (block until the job completes).
fn submit_synchronously(
    unit: &Unit,
    spec: spool::JobArraySpec,
    input_name: String,
    options: SweepOptions,
    logs_dir: &Path,
    scheduler: &dyn SchedulerAdapter,
    suite: &dyn suite::Suite,
    config: &Config,
) {
    let request = scheduler::SubmitRequest {
        unit,
        spec: spec.clone(),
        command: suite.action(&unit.path, &input_name),
        wait: true,
        high_priority: options.high_priority,
        logs_dir,
        dry_run: options.dry_run,
    };

    match scheduler.submit(&request, config) {
        scheduler::SubmitOutcome::Submitted(job_id) => {
            tracing::info!(unit = %unit.name, job_id, array = %spec.as_job_name(), "submitted (single-shot)");
        }
        scheduler::SubmitOutcome::QueueClosed => {
            tracing::warn!(unit = %unit.name, array = %spec.as_job_name(), "queue closed");
        }
        scheduler::SubmitOutcome::Transient { code, stderr } => {
            tracing::warn!(unit = %unit.name, array = %spec.as_job_name(), ?code, stderr, "transient submit failure");
        }
        scheduler::SubmitOutcome::DryRun(command) => {
            tracing::info!(unit = %unit.name, command = %command.display(), "dry-run submit (single-shot)");
        }
    }
}

/// `-v`: read-only validation. Only upserts into a cache when the operator
/// explicitly supplied one with `-i`; a bare `-v` never creates or mutates
/// `<spoolroot>.cache`.
fn run_validate(spool_root: &Path, cache: Option<&dyn Cache>, suite: &dyn suite::Suite) -> Result<i32> {
    let units = spool::enumerate_units(spool_root)?;
    let mut any_incomplete = false;
    for unit in &units {
        let result = validate::validate(unit, suite, cache)?;
        match result {
            validate::Validation::NoInputs => {
                tracing::info!(unit = %unit.name, "no inputs");
            }
            validate::Validation::Complete => {
                tracing::info!(unit = %unit.name, "complete");
            }
            validate::Validation::Incomplete { files } => {
                any_incomplete = true;
                tracing::info!(unit = %unit.name, files = ?files, "incomplete");
            }
        }
    }
    Ok(if any_incomplete { 1 } else { 0 })
}

/// `-c`: report the running-job count for the argument.
fn run_count(spool_root: &Path, scheduler: &dyn SchedulerAdapter, config: &Config) -> Result<i32> {
    let units = spool::enumerate_units(spool_root)?;
    let mut total = 0u64;
    for unit in &units {
        let spec = spool::JobArraySpec::Range {
            name: unit.name.clone(),
            count: 1,
        };
        total += scheduler.running_count(&spec, config)?;
    }
    println!("{total}");
    Ok(0)
}

/// `-w`: wait (poll, sleeping `sleepval` between checks) for every unit's
/// running jobs to drain.
fn run_wait(spool_root: &Path, scheduler: &dyn SchedulerAdapter, config: &Config) -> Result<i32> {
    let units = spool::enumerate_units(spool_root)?;
    for unit in &units {
        let spec = spool::JobArraySpec::Range {
            name: unit.name.clone(),
            count: 1,
        };
        loop {
            let running = scheduler.running_count(&spec, config)?;
            if running == 0 {
                break;
            }
            tracing::info!(unit = %unit.name, running, "waiting for jobs to drain");
            std::thread::sleep(std::time::Duration::from_secs(config.sleepval));
        }
    }
    Ok(0)
}

/// Reconstructs a [`Unit`] from a cache key (an absolute unit path), used
/// by the process phase when it re-fetches paths out of the cache.
fn unit_from_cache_key(path: &str) -> Option<Unit> {
    let path = PathBuf::from(path);
    let name = path.file_name()?.to_string_lossy().into_owned();
    Some(Unit { path, name })
}
