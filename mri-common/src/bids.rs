//! BIDS-style path templating
//!
//! Helpers that turn (subject, session, scan) identifiers into paths and
//! file names, and that expand path templates with `{placeholder}` fields.

use crate::error::{Error, Result};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;

/// Default file extension for image outputs
pub const NIFTI_GZ: &str = ".nii.gz";

/// Concatenate subject and session to a BIDS-style relative directory
///
/// ```
/// use mri_common::bids::subject_session_path;
/// assert_eq!(subject_session_path("5502", "ofM"), "sub-5502/ses-ofM");
/// ```
pub fn subject_session_path(subject: &str, session: &str) -> String {
    format!("sub-{}/ses-{}", subject, session)
}

/// Build a BIDS-style file name from subject, session and scan identifiers
///
/// `scan_prefix` is the entity key placed in front of the scan (commonly
/// `trial`), `suffix` the measurement type (commonly `bold` or `cbv`).
///
/// ```
/// use mri_common::bids::bids_filename;
/// assert_eq!(
///     bids_filename("5502", "ofM", "EPI_CBV_alej", Some("trial"), Some("cbv"), ".nii.gz"),
///     "sub-5502_ses-ofM_trial-EPI_CBV_alej_cbv.nii.gz"
/// );
/// ```
pub fn bids_filename(
    subject: &str,
    session: &str,
    scan: &str,
    scan_prefix: Option<&str>,
    suffix: Option<&str>,
    extension: &str,
) -> String {
    let suffix = match suffix {
        Some(s) if !s.is_empty() => format!("_{}", s),
        _ => String::new(),
    };
    let scan = match scan_prefix {
        Some(prefix) if !prefix.is_empty() => format!("{}-{}{}{}", prefix, scan, suffix, extension),
        _ => format!("{}{}{}", scan, suffix, extension),
    };
    format!("sub-{}_ses-{}_{}", subject, session, scan)
}

/// How a source template is filled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourceGrouping {
    /// One file per (subject, session, trial)
    #[default]
    Individual,
    /// All subjects and trials of a session (subject and trial become `*`)
    Session,
}

impl FromStr for SourceGrouping {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "individual" => Ok(Self::Individual),
            "session" => Ok(Self::Session),
            other => Err(Error::Config(format!(
                "Source grouping must be individual or session, got {}",
                other
            ))),
        }
    }
}

/// Fill a source template from one substitution
///
/// With `SourceGrouping::Session` the subject and trial fields become glob
/// wildcards. The result is joined onto `base_directory` when given.
pub fn format_source(
    template: &str,
    substitution: &Substitution,
    grouping: SourceGrouping,
    base_directory: Option<&Path>,
) -> String {
    let source = match grouping {
        SourceGrouping::Individual => substitution.format(template),
        SourceGrouping::Session => Substitution {
            subject: "*".to_string(),
            trial: "*".to_string(),
            ..substitution.clone()
        }
        .format(template),
    };

    match base_directory {
        Some(base) => base.join(source).to_string_lossy().into_owned(),
        None => source,
    }
}

/// One entry of a substitution iterator
///
/// Together with a path template this identifies one input file of a
/// pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Substitution {
    pub data_dir: String,
    pub preprocessing_dir: String,
    pub preprocessing_workdir: String,
    pub l1_dir: String,
    pub l1_workdir: String,
    pub subject: String,
    pub session: String,
    pub trial: String,
}

impl Substitution {
    /// Field name and value pairs, in a fixed order
    pub fn fields(&self) -> [(&'static str, &str); 8] {
        [
            ("data_dir", self.data_dir.as_str()),
            ("preprocessing_dir", self.preprocessing_dir.as_str()),
            ("preprocessing_workdir", self.preprocessing_workdir.as_str()),
            ("l1_dir", self.l1_dir.as_str()),
            ("l1_workdir", self.l1_workdir.as_str()),
            ("subject", self.subject.as_str()),
            ("session", self.session.as_str()),
            ("trial", self.trial.as_str()),
        ]
    }

    /// Replace every `{field}` in `template`; unknown placeholders are kept
    pub fn format(&self, template: &str) -> String {
        self.fields()
            .iter()
            .fold(template.to_string(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
    }
}

/// Directory names that the substitution iterator derives from the pipeline name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineDirs {
    /// Level-1 pipeline name (defaults to the preprocessing name)
    pub l1_dir: Option<String>,
    /// Level-1 work directory (defaults to `<l1_dir>_work`)
    pub l1_workdir: Option<String>,
    /// Preprocessing work directory (defaults to `<preprocessing_dir>_work`)
    pub preprocessing_workdir: Option<String>,
}

/// Build substitutions for every (subject, session, trial) combination
///
/// Iteration order is subjects outermost, then sessions, then trials.
pub fn substitution_iterator(
    sessions: &[String],
    subjects: &[String],
    trials: &[String],
    data_dir: &str,
    preprocessing_dir: &str,
    dirs: &PipelineDirs,
) -> Vec<Substitution> {
    let l1_dir = dirs
        .l1_dir
        .clone()
        .unwrap_or_else(|| preprocessing_dir.to_string());
    let l1_workdir = dirs
        .l1_workdir
        .clone()
        .unwrap_or_else(|| format!("{}_work", l1_dir));
    let preprocessing_workdir = dirs
        .preprocessing_workdir
        .clone()
        .unwrap_or_else(|| format!("{}_work", preprocessing_dir));

    let mut substitutions = Vec::with_capacity(subjects.len() * sessions.len() * trials.len());
    for subject in subjects {
        for session in sessions {
            for trial in trials {
                substitutions.push(Substitution {
                    data_dir: data_dir.to_string(),
                    preprocessing_dir: preprocessing_dir.to_string(),
                    preprocessing_workdir: preprocessing_workdir.clone(),
                    l1_dir: l1_dir.clone(),
                    l1_workdir: l1_workdir.clone(),
                    subject: subject.clone(),
                    session: session.clone(),
                    trial: trial.clone(),
                });
            }
        }
    }
    substitutions
}

/// Apply ordered (pattern, replacement) pairs to a path string
///
/// Used to strip iteration-variable prefixes such as `_condition_` from
/// result paths before they are written.
pub fn apply_substitutions(path: &str, substitutions: &[(String, String)]) -> String {
    substitutions
        .iter()
        .fold(path.to_string(), |acc, (pattern, replacement)| {
            acc.replace(pattern.as_str(), replacement.as_str())
        })
}
