//! The validator: a read-only classification of a spool unit's
//! completeness, independent of the decider's submission policy.
//!
//! Unlike the decider, the validator never consults the scheduler and never
//! submits; it only answers "what does the filesystem say right now". When
//! a cache file is explicitly supplied it also records what it found, using
//! the same fields the decider would (`complete`, `files`), but only ever
//! writing `0` or `1` - the validator cannot determine abandonment, since
//! that requires the retry count the decider tracks.

use crate::cache::Cache;
use crate::cache::CompleteState;
use crate::spool;
use crate::spool::SpoolError;
use crate::spool::Unit;
use crate::suite::Suite;

/// The outcome of validating one unit against the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The unit has no input files at all.
    NoInputs,
    /// Every input passed the suite's completeness check.
    Complete,
    /// At least one input has not yet produced a valid output.
    Incomplete {
        /// Base names of the incomplete inputs.
        files: Vec<String>,
    },
}

/// Classifies `unit` against the filesystem using `suite`, optionally
/// upserting the result into `cache`.
pub fn validate(
    unit: &Unit,
    suite: &dyn Suite,
    cache: Option<&dyn Cache>,
) -> Result<Validation, SpoolError> {
    spool::validate_unit_structure(unit)?;
    let inputs = spool::list_inputs(unit)?;

    if inputs.is_empty() {
        return Ok(Validation::NoInputs);
    }

    let incomplete: Vec<String> = inputs
        .iter()
        .filter(|input| !suite.is_complete(input))
        .map(|input| {
            input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
        .collect();

    let result = if incomplete.is_empty() {
        Validation::Complete
    } else {
        Validation::Incomplete { files: incomplete }
    };

    if let Some(cache) = cache {
        let key = unit.path.to_string_lossy().into_owned();
        match &result {
            Validation::Complete => {
                let _ = cache.set_complete(&key, CompleteState::Complete);
            }
            Validation::Incomplete { files } => {
                let _ = cache.set_complete(&key, CompleteState::Incomplete);
                let _ = cache.set_files(&key, &files.join(","));
            }
            Validation::NoInputs => {}
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::cache::SqliteCache;
    use crate::suite::CopySuite;

    fn make_unit(dir: &std::path::Path, inputs: &[&str], outputs: &[&str]) -> Unit {
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
    fn empty_unit_has_no_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("u");
        fs::create_dir_all(&unit_dir).unwrap();
        let unit = Unit {
            path: unit_dir,
            name: "u".to_string(),
        };

        let result = validate(&unit, &CopySuite, None).unwrap();
        assert_eq!(result, Validation::NoInputs);
    }

    #[test]
    fn fully_complete_unit_reports_complete() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1"], &["u-1-output"]);

        let result = validate(&unit, &CopySuite, None).unwrap();
        assert_eq!(result, Validation::Complete);
    }

    #[test]
    fn partial_unit_lists_incomplete_basenames() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1", "u-2"], &["u-1-output"]);

        let result = validate(&unit, &CopySuite, None).unwrap();
        assert_eq!(
            result,
            Validation::Incomplete {
                files: vec!["u-2".to_string()]
            }
        );
    }

    #[test]
    fn supplying_a_cache_upserts_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let unit = make_unit(dir.path(), &["u-1", "u-2"], &["u-1-output"]);
        let cache = SqliteCache::open(dir.path().join("explicit.cache")).unwrap();

        validate(&unit, &CopySuite, Some(&cache)).unwrap();

        let record = cache.fetch(&unit.path.to_string_lossy()).unwrap().unwrap();
        assert_eq!(record.complete, Some(CompleteState::Incomplete));
        assert_eq!(record.files, "u-2");
    }

    #[test]
    fn validating_with_no_inputs_does_not_create_a_cache_record() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("u");
        fs::create_dir_all(&unit_dir).unwrap();
        let unit = Unit {
            path: unit_dir,
            name: "u".to_string(),
        };
        let cache = SqliteCache::open(dir.path().join("explicit.cache")).unwrap();

        validate(&unit, &CopySuite, Some(&cache)).unwrap();
        assert!(cache.fetch(&unit.path.to_string_lossy()).unwrap().is_none());
    }
}
