//! Spool layout: enumerating spool units, classifying their entries, and
//! deriving scheduler job-array specifications from the filesystem.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use regex::Regex;
use thiserror::Error;

/// The suffix appended to an input file's name to form its output file's
/// name.
pub const OUTPUT_SUFFIX: &str = "-output";

/// Errors raised while enumerating or validating the spool layout.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// An I/O error occurred while listing a directory.
    #[error("failed to list `{path}`: {source}")]
    Io {
        /// The directory that could not be listed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A spool unit contains entries that don't belong to it.
    #[error(
        "spool unit `{unit}` has unexpected entries that do not match its naming convention: \
         {entries:?}"
    )]
    UnexpectedEntries {
        /// The unit's base name.
        unit: String,
        /// The offending entry names.
        entries: Vec<String>,
    },

    /// A spool unit (submitted as a job array) has no input files.
    #[error("spool unit `{0}` has no input files")]
    Empty(String),
}

/// A single spool unit: either a subdirectory of inputs, or the spool root
/// itself when the root is a directory of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    /// The absolute path to the unit's directory.
    pub path: PathBuf,
    /// The unit's base name (used as the job-array name).
    pub name: String,
}

/// A derived job-array specification for a scheduler submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobArraySpec {
    /// Submit the whole unit as `name[1-count]`, or `name[N]` when
    /// `count == 1` and the submission targets a single file.
    Range {
        /// The unit name.
        name: String,
        /// The number of array elements.
        count: u64,
    },
    /// Submit a single input file as `name[index]`.
    Single {
        /// The unit name.
        name: String,
        /// The array index, taken from the input file's trailing integer.
        index: u64,
    },
}

impl JobArraySpec {
    /// Renders the `-J` argument value for this spec.
    pub fn as_job_name(&self) -> String {
        match self {
            JobArraySpec::Range { name, count } => {
                if *count == 1 {
                    format!("{name}[1-1]")
                } else {
                    format!("{name}[1-{count}]")
                }
            }
            JobArraySpec::Single { name, index } => format!("{name}[{index}]"),
        }
    }

    /// The bare unit name this spec belongs to, used to query
    /// `RunningCount`.
    pub fn unit_name(&self) -> &str {
        match self {
            JobArraySpec::Range { name, .. } | JobArraySpec::Single { name, .. } => name,
        }
    }
}

/// Returns `true` if `name` is a dotfile (hidden entry), which the spool
/// layout excludes from enumeration.
fn is_dotfile(name: &str) -> bool {
    name.starts_with('.')
}

/// Returns `true` if `basename` names an output file.
pub fn is_output_name(basename: &str) -> bool {
    basename.ends_with(OUTPUT_SUFFIX)
}

/// Extracts the trailing `-<N>` integer from a base name, per the design's
/// sort key: the suffix is read after stripping an optional `-output`
/// marker, so an output file sorts with its input. A missing integer sorts
/// as `0`.
///
/// This is intentionally a pure function of the base name alone - digits
/// appearing in parent directory components never affect the result, which
/// is the behavior the design doc's FIXME asks re-implementers to pin down
/// with tests.
pub fn trailing_index(basename: &str) -> u64 {
    let stripped = basename.strip_suffix(OUTPUT_SUFFIX).unwrap_or(basename);

    match stripped.rfind('-') {
        Some(pos) => stripped[pos + 1..].parse().unwrap_or(0),
        None => 0,
    }
}

/// Lists the immediate (non-recursive) entries of `path`, excluding
/// dotfiles, sorted ascending by [`trailing_index`] of the entry's base
/// name.
fn list_one_level(path: &Path) -> Result<Vec<PathBuf>, SpoolError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).map_err(|source| SpoolError::Io {
        path: path.to_path_buf(),
        source,
    })? {
        let entry = entry.map_err(|source| SpoolError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if is_dotfile(&name) {
            continue;
        }
        entries.push(entry.path());
    }

    entries.sort_by_key(|p| {
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        trailing_index(&name)
    });

    Ok(entries)
}

/// Enumerates the spool units under `spool_root`.
///
/// If `spool_root` contains any subdirectories (excluding dotfiles), each
/// subdirectory is a unit. Otherwise, the root itself is the single unit.
pub fn enumerate_units(spool_root: &Path) -> Result<Vec<Unit>, SpoolError> {
    let entries = list_one_level(spool_root)?;
    let has_subdirs = entries.iter().any(|p| p.is_dir());

    if has_subdirs {
        Ok(entries
            .into_iter()
            .filter(|p| p.is_dir())
            .map(|path| {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Unit { path, name }
            })
            .collect())
    } else {
        let name = spool_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(vec![Unit {
            path: spool_root.to_path_buf(),
            name,
        }])
    }
}

/// Lists the input files of a unit (entries whose name does not end in
/// `-output`), sorted by trailing index.
pub fn list_inputs(unit: &Unit) -> Result<Vec<PathBuf>, SpoolError> {
    let entries = list_one_level(&unit.path)?;
    Ok(entries
        .into_iter()
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .map(|n| !is_output_name(&n.to_string_lossy()))
                    .unwrap_or(false)
        })
        .collect())
}

/// Validates that every entry under a unit matches the naming convention
/// `(^|\w+-)<unitname>.*(-\d+)+(|-output)$`, raising a structural error
/// listing every offending entry.
pub fn validate_unit_structure(unit: &Unit) -> Result<(), SpoolError> {
    let pattern = format!(
        r"(^|\w+-){}.*(-\d+)+(|-output)$",
        regex::escape(&unit.name)
    );
    let regex = Regex::new(&pattern).expect("unit-name pattern is always valid");

    let entries = list_one_level(&unit.path)?;
    let offending: Vec<String> = entries
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .filter(|name| !regex.is_match(name))
        .collect();

    if offending.is_empty() {
        Ok(())
    } else {
        Err(SpoolError::UnexpectedEntries {
            unit: unit.name.clone(),
            entries: offending,
        })
    }
}

/// Derives the job-array spec for submitting the whole unit (used when no
/// inputs are individually incomplete).
pub fn array_spec_for_unit(unit: &Unit) -> Result<JobArraySpec, SpoolError> {
    let inputs = list_inputs(unit)?;
    if inputs.is_empty() {
        return Err(SpoolError::Empty(unit.name.clone()));
    }

    Ok(JobArraySpec::Range {
        name: unit.name.clone(),
        count: inputs.len() as u64,
    })
}

/// Derives the job-array spec for submitting a single input file.
pub fn array_spec_for_input(unit: &Unit, input: &Path) -> JobArraySpec {
    let basename = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    JobArraySpec::Single {
        name: unit.name.clone(),
        index: trailing_index(&basename),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_index_single_digit() {
        assert_eq!(trailing_index("u-1"), 1);
    }

    #[test]
    fn trailing_index_multi_digit() {
        assert_eq!(trailing_index("u-42"), 42);
    }

    #[test]
    fn trailing_index_output_suffix_uses_input_index() {
        assert_eq!(trailing_index("u-7-output"), 7);
    }

    #[test]
    fn trailing_index_ignores_digits_in_parent() {
        // The function only ever sees a base name, so digits that happen to
        // live in a parent directory component can't leak in.
        let basename = Path::new("/spool/run-123/u-9")
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert_eq!(trailing_index(&basename), 9);
    }

    #[test]
    fn trailing_index_missing_sorts_as_zero() {
        assert_eq!(trailing_index("readme"), 0);
    }

    #[test]
    fn job_array_spec_single_input_unit_uses_range_1_1() {
        let unit = Unit {
            path: PathBuf::from("/spool/u"),
            name: "u".to_string(),
        };
        let spec = JobArraySpec::Range {
            name: unit.name.clone(),
            count: 1,
        };
        assert_eq!(spec.as_job_name(), "u[1-1]");
    }

    #[test]
    fn job_array_spec_for_single_file_uses_index() {
        let unit = Unit {
            path: PathBuf::from("/spool/u"),
            name: "u".to_string(),
        };
        let spec = array_spec_for_input(&unit, Path::new("/spool/u/u-3"));
        assert_eq!(spec.as_job_name(), "u[3]");
    }

    #[test]
    fn structural_validation_rejects_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("u");
        fs::create_dir(&unit_dir).unwrap();
        fs::write(unit_dir.join("u-1"), b"a").unwrap();
        fs::write(unit_dir.join("stray.txt"), b"b").unwrap();

        let unit = Unit {
            path: unit_dir,
            name: "u".to_string(),
        };

        let err = validate_unit_structure(&unit).unwrap_err();
        match err {
            SpoolError::UnexpectedEntries { entries, .. } => {
                assert_eq!(entries, vec!["stray.txt".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn structural_validation_accepts_inputs_and_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("u");
        fs::create_dir(&unit_dir).unwrap();
        fs::write(unit_dir.join("u-1"), b"a").unwrap();
        fs::write(unit_dir.join("u-1-output"), b"b").unwrap();
        fs::write(unit_dir.join("u-2"), b"c").unwrap();

        let unit = Unit {
            path: unit_dir,
            name: "u".to_string(),
        };

        validate_unit_structure(&unit).unwrap();
    }

    #[test]
    fn enumerate_units_directory_of_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();

        let units = enumerate_units(dir.path()).unwrap();
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn enumerate_units_directory_of_files_is_single_unit() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("u-1"), b"a").unwrap();
        fs::write(dir.path().join("u-2"), b"b").unwrap();

        let units = enumerate_units(dir.path()).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].path, dir.path());
    }

    #[test]
    fn empty_unit_has_no_array_spec() {
        let dir = tempfile::tempdir().unwrap();
        let unit_dir = dir.path().join("u");
        fs::create_dir(&unit_dir).unwrap();

        let unit = Unit {
            path: unit_dir,
            name: "u".to_string(),
        };

        let err = array_spec_for_unit(&unit).unwrap_err();
        assert!(matches!(err, SpoolError::Empty(_)));
    }
}
