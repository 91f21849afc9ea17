//! The per-unit decider: the admission/retry control loop applied to one
//! spool unit.
//!
//! The ten-step ordering below is load-bearing - rearranging steps
//! reintroduces bugs the design notes call out by name (e.g. marking a unit
//! complete while its jobs are still running). Every step is a guard clause
//! that either returns a [`Decision`] or falls through to the next step.

use std::path::Path;
use std::path::PathBuf;

use chrono::Utc;

use crate::cache::Cache;
use crate::cache::CompleteState;
use crate::config::Config;
use crate::scheduler::QueueDepth;
use crate::scheduler::SchedulerAdapter;
use crate::spool;
use crate::spool::JobArraySpec;
use crate::spool::Unit;
use crate::suite::Suite;

/// Whether the decider may proceed to the submission steps (7-10) or must
/// stop after filesystem validation (step 5).
///
/// [`Mode::ReadOnly`] is what the design notes call "build-only mode" in
/// step 6 - it is used by the validator (C7), which shares this policy's
/// filesystem-validation logic but never submits. The `-b` CLI flag is a
/// different thing: a single non-looping sweep that still runs in
/// [`Mode::Process`], since the CLI table documents that a build-only sweep
/// "may still submit unless `-n`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Validate the filesystem and update the cache, but never submit.
    ReadOnly,
    /// Submit as the policy dictates.
    Process,
}

/// One submission the decider wants performed: either the whole unit as a
/// job array, or a list of individually-incomplete inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitPlan {
    /// Submit the entire unit as one job array.
    WholeUnit,
    /// Submit each listed input individually.
    Inputs(Vec<PathBuf>),
}

/// The outcome of one decider invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do; the caller moves on to the next unit.
    Skip,
    /// The caller should sleep `seconds` and then revisit this same unit.
    Sleep {
        /// How long to sleep.
        seconds: u64,
    },
    /// Submit according to `plan`.
    Submit {
        /// What to submit.
        plan: SubmitPlan,
    },
    /// The unit was just marked complete on this pass.
    MarkedComplete,
    /// The unit was just abandoned (retry cap exceeded) on this pass.
    Abandoned,
}

/// Runs the ten-step policy from the design notes for one unit, mutating the
/// cache as steps 3, 5, 8, 9, and 10 dictate and returning the resulting
/// [`Decision`].
#[allow(clippy::too_many_arguments)]
pub fn decide(
    unit: &Unit,
    mode: Mode,
    cache: &dyn Cache,
    scheduler: &dyn SchedulerAdapter,
    suite: &dyn Suite,
    config: &Config,
) -> Decision {
    let key = unit.path.to_string_lossy().into_owned();
    let record = cache.fetch(&key).ok().flatten();

    // Step 1: terminal check.
    if let Some(record) = &record {
        if record.complete == Some(CompleteState::Complete) {
            return Decision::Skip;
        }
    }

    // Step 2: churn guard. Absence of `time` bypasses the guard.
    let now = Utc::now();
    if let Some(last) = record.as_ref().and_then(|r| r.time) {
        if (now - last).num_seconds() < config.churnrate {
            return Decision::Sleep {
                seconds: config.sleepval,
            };
        }
    }

    // Step 3: stamp time.
    if cache.set_time(&key, now).is_err() {
        tracing::warn!(unit = %unit.name, "failed to stamp cache time");
    }

    // Step 4: running guard.
    let spec_for_running = JobArraySpec::Range {
        name: unit.name.clone(),
        count: 1,
    };
    match scheduler.running_count(&spec_for_running, config) {
        Ok(count) if count > 0 => {
            tracing::info!(unit = %unit.name, count, "unit has jobs running, skipping");
            return Decision::Skip;
        }
        Err(err) => {
            tracing::warn!(unit = %unit.name, error = %err, "failed to query running count");
        }
        _ => {}
    }

    // Step 5: validate on filesystem.
    let inputs = match spool::list_inputs(unit) {
        Ok(inputs) => inputs,
        Err(err) => {
            tracing::warn!(unit = %unit.name, error = %err, "failed to list inputs");
            return Decision::Skip;
        }
    };

    if inputs.is_empty() {
        return Decision::Skip;
    }

    let incomplete: Vec<PathBuf> = inputs
        .iter()
        .filter(|input| !suite.is_complete(input))
        .cloned()
        .collect();

    if incomplete.is_empty() {
        let _ = cache.set_complete(&key, CompleteState::Complete);
        return Decision::MarkedComplete;
    }

    let _ = cache.set_complete(&key, CompleteState::Incomplete);
    if incomplete.len() == inputs.len() {
        let _ = cache.set_files(&key, "");
    } else {
        let files = incomplete
            .iter()
            .map(|p| basename(p))
            .collect::<Vec<_>>()
            .join(",");
        let _ = cache.set_files(&key, &files);
    }

    // Step 6: build-only short-circuit.
    if mode == Mode::ReadOnly {
        return Decision::Skip;
    }

    // Step 7: queue admission.
    match scheduler.queue_depth(config) {
        Ok(QueueDepth::Known(depth)) if depth > config.queueceiling => {
            wait_for_floor(scheduler, config);
            return Decision::Skip;
        }
        Ok(_) => {}
        Err(err) => {
            tracing::warn!(unit = %unit.name, error = %err, "failed to query queue depth");
        }
    }

    // Step 8: retry cap.
    let count = record.as_ref().map(|r| r.count).unwrap_or(0);
    if config.lsf_tries > 0 && count >= config.lsf_tries as i64 {
        let _ = cache.set_complete(&key, CompleteState::Abandoned);
        tracing::info!(unit = %unit.name, count, "retry cap exceeded, abandoning unit");
        return Decision::Abandoned;
    }

    // Step 9: stop flag.
    if let Some(stopflag) = &config.stopflag {
        if stopflag.exists() {
            let _ = cache.set_time(&key, Utc::now());
            tracing::info!(unit = %unit.name, "stop flag present, deferring submission");
            return Decision::Skip;
        }
    }

    // Step 10: submit. `count` tracks submissions, not decider passes: a
    // whole-unit array is one submission, but submitting each incomplete
    // input individually is one submission per input (§3, §8 scenario 3).
    let _ = cache.set_time(&key, Utc::now());

    if incomplete.len() == inputs.len() {
        let _ = cache.increment_count(&key);
        Decision::Submit {
            plan: SubmitPlan::WholeUnit,
        }
    } else {
        for _ in 0..incomplete.len() {
            let _ = cache.increment_count(&key);
        }
        Decision::Submit {
            plan: SubmitPlan::Inputs(incomplete),
        }
    }
}

/// Blocks (by sleeping in a loop) until the queue depth reported by
/// `scheduler` drops below `config.queuefloor`, or the depth becomes
/// unknown.
fn wait_for_floor(scheduler: &dyn SchedulerAdapter, config: &Config) {
    loop {
        match scheduler.queue_depth(config) {
            Ok(QueueDepth::Known(depth)) if depth >= config.queuefloor => {
                std::thread::sleep(std::time::Duration::from_secs(config.sleepval));
            }
            _ => return,
        }
    }
}

/// Extracts the base name of a path as a `String`.
fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::fs;

    use super::*;
    use crate::cache::SqliteCache;
    use crate::scheduler::SchedulerError;
    use crate::scheduler::SubmitOutcome;
    use crate::scheduler::SubmitRequest;
    use crate::suite::CopySuite;

    struct StubScheduler {
        running: u64,
        depth: QueueDepth,
        queue_depth_calls: Cell<u64>,
    }

    impl StubScheduler {
        fn idle() -> Self {
            Self {
                running: 0,
                depth: QueueDepth::Known(0),
                queue_depth_calls: Cell::new(0),
            }
        }
    }

    impl SchedulerAdapter for StubScheduler {
        fn submit(&self, _request: &SubmitRequest<'_>, _config: &Config) -> SubmitOutcome {
            SubmitOutcome::Submitted(1)
        }

        fn running_count(
            &self,
            _spec: &JobArraySpec,
            _config: &Config,
        ) -> Result<u64, SchedulerError> {
            Ok(self.running)
        }

        fn queue_depth(&self, _config: &Config) -> Result<QueueDepth, SchedulerError> {
            self.queue_depth_calls.set(self.queue_depth_calls.get() + 1);
            Ok(self.depth)
        }
    }

    fn test_config() -> Config {
        let yaml = r#"
queue: normal
sleepval: 1
queueceiling: 500
queuefloor: 400
churnrate: 60
lsf_tries: 2
db_tries: 3
suite:
  name: copy
"#;
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn make_unit(dir: &Path, inputs: &[&str], outputs: &[&str]) -> Unit {
        let unit_dir = dir.join("u");
        fs::create_dir_all(&unit_dir).unwrap();
        for input in inputs {
            fs::write(unit_dir.join(input), b"data").unwrap();
        }
        for output in outputs {
            fs::write(unit_dir.join(output), b"result").unwrap();
        }
        Unit {
            path: unit_dir,
            name: "u".to_string(),
        }
    }

    #[test]
    fn fresh_unit_with_no_outputs_submits_whole_unit() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1", "u-2"], &[]);
        let cache = SqliteCache::open(dir.path().join("spool.cache")).unwrap();
        let scheduler = StubScheduler::idle();
        let suite = CopySuite;
        let config = test_config();

        let decision = decide(&unit, Mode::Process, &cache, &scheduler, &suite, &config);
        assert_eq!(
            decision,
            Decision::Submit {
                plan: SubmitPlan::WholeUnit
            }
        );

        let record = cache.fetch(&unit.path.to_string_lossy()).unwrap().unwrap();
        assert_eq!(record.complete, Some(CompleteState::Incomplete));
        assert_eq!(record.count, 1);
        assert_eq!(record.files, "");
    }

    #[test]
    fn partial_unit_submits_only_incomplete_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1", "u-2", "u-3"], &["u-2-output"]);
        let cache = SqliteCache::open(dir.path().join("spool.cache")).unwrap();
        let scheduler = StubScheduler::idle();
        let suite = CopySuite;
        let config = test_config();

        let decision = decide(&unit, Mode::Process, &cache, &scheduler, &suite, &config);
        match decision {
            Decision::Submit {
                plan: SubmitPlan::Inputs(inputs),
            } => {
                let names: Vec<String> = inputs.iter().map(|p| basename(p)).collect();
                assert_eq!(names, vec!["u-1".to_string(), "u-3".to_string()]);
            }
            other => panic!("unexpected decision: {other:?}"),
        }

        let record = cache.fetch(&unit.path.to_string_lossy()).unwrap().unwrap();
        assert_eq!(record.files, "u-1,u-3");
        // Two individual submissions (`u-1`, `u-3`) count as two, not one.
        assert_eq!(record.count, 2);
    }

    #[test]
    fn churn_guard_sleeps_within_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1"], &[]);
        let cache = SqliteCache::open(dir.path().join("spool.cache")).unwrap();
        cache
            .set_time(&unit.path.to_string_lossy(), Utc::now())
            .unwrap();

        let scheduler = StubScheduler::idle();
        let suite = CopySuite;
        let config = test_config();

        let decision = decide(&unit, Mode::Process, &cache, &scheduler, &suite, &config);
        assert_eq!(
            decision,
            Decision::Sleep {
                seconds: config.sleepval
            }
        );
        assert_eq!(scheduler.queue_depth_calls.get(), 0);
    }

    #[test]
    fn retry_cap_abandons_unit() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1", "u-2"], &[]);
        let cache = SqliteCache::open(dir.path().join("spool.cache")).unwrap();
        let key = unit.path.to_string_lossy().into_owned();
        cache.increment_count(&key).unwrap();
        cache.increment_count(&key).unwrap();

        let scheduler = StubScheduler::idle();
        let suite = CopySuite;
        let config = test_config();

        let decision = decide(&unit, Mode::Process, &cache, &scheduler, &suite, &config);
        assert_eq!(decision, Decision::Abandoned);

        let record = cache.fetch(&key).unwrap().unwrap();
        assert_eq!(record.complete, Some(CompleteState::Abandoned));
    }

    #[test]
    fn stop_flag_defers_submission_without_marking_complete() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1"], &[]);
        let cache = SqliteCache::open(dir.path().join("spool.cache")).unwrap();
        let scheduler = StubScheduler::idle();
        let suite = CopySuite;
        let mut config = test_config();

        let stopfile = dir.path().join("STOP");
        fs::write(&stopfile, b"").unwrap();
        config.stopflag = Some(stopfile);

        let decision = decide(&unit, Mode::Process, &cache, &scheduler, &suite, &config);
        assert_eq!(decision, Decision::Skip);

        let record = cache.fetch(&unit.path.to_string_lossy()).unwrap().unwrap();
        assert_eq!(record.complete, Some(CompleteState::Incomplete));
        assert_eq!(record.count, 0);
    }

    #[test]
    fn all_outputs_present_marks_complete() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1"], &["u-1-output"]);
        let cache = SqliteCache::open(dir.path().join("spool.cache")).unwrap();
        let scheduler = StubScheduler::idle();
        let suite = CopySuite;
        let config = test_config();

        let decision = decide(&unit, Mode::Process, &cache, &scheduler, &suite, &config);
        assert_eq!(decision, Decision::MarkedComplete);

        let record = cache.fetch(&unit.path.to_string_lossy()).unwrap().unwrap();
        assert_eq!(record.complete, Some(CompleteState::Complete));
    }

    #[test]
    fn terminal_unit_is_skipped_without_touching_the_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1"], &["u-1-output"]);
        let cache = SqliteCache::open(dir.path().join("spool.cache")).unwrap();
        cache
            .set_complete(&unit.path.to_string_lossy(), CompleteState::Complete)
            .unwrap();

        let scheduler = StubScheduler::idle();
        let suite = CopySuite;
        let config = test_config();

        let decision = decide(&unit, Mode::Process, &cache, &scheduler, &suite, &config);
        assert_eq!(decision, Decision::Skip);
        assert_eq!(scheduler.queue_depth_calls.get(), 0);
    }

    #[test]
    fn empty_unit_is_skipped_and_never_marked_complete() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("u");
        fs::create_dir_all(&unit_dir).unwrap();
        let unit = Unit {
            path: unit_dir,
            name: "u".to_string(),
        };
        let cache = SqliteCache::open(dir.path().join("spool.cache")).unwrap();
        let scheduler = StubScheduler::idle();
        let suite = CopySuite;
        let config = test_config();

        let decision = decide(&unit, Mode::Process, &cache, &scheduler, &suite, &config);
        assert_eq!(decision, Decision::Skip);
        assert_eq!(cache.fetch(&unit.path.to_string_lossy()).unwrap(), None);
    }

    #[test]
    fn read_only_mode_never_submits() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1"], &[]);
        let cache = SqliteCache::open(dir.path().join("spool.cache")).unwrap();
        let scheduler = StubScheduler::idle();
        let suite = CopySuite;
        let config = test_config();

        let decision = decide(&unit, Mode::ReadOnly, &cache, &scheduler, &suite, &config);
        assert_eq!(decision, Decision::Skip);

        let record = cache.fetch(&unit.path.to_string_lossy()).unwrap().unwrap();
        assert_eq!(record.complete, Some(CompleteState::Incomplete));
        assert_eq!(record.count, 0);
    }
}
