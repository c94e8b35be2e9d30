//! BIDS tree discovery
//!
//! Finds input files in BIDS-layout directories by matching relative paths
//! against per-modality patterns:
//!
//! ```text
//! sub-<subject>/ses-<session>/func/…_trial-<trial>.nii.gz
//! sub-<subject>/ses-<session>/anat/…_<trial>.nii.gz
//! sub-<subject>/ses-<session>/…_trial-<scan>_cope.nii.gz     (level-1 results)
//! ```

use crate::error::{PipelineError, Result};
use mri_common::bids::{
    bids_filename, format_source, subject_session_path, substitution_iterator, PipelineDirs, SourceGrouping,
    Substitution, NIFTI_GZ,
};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Modalities [`bids_autofind`] can source
pub const MODALITIES: [&str; 2] = ["func", "anat"];

/// Path template plus one substitution per discovered file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Autofind {
    /// Formats to a file path with any of `substitutions`
    pub path_template: String,
    pub substitutions: Vec<Substitution>,
}

/// Generate a path template and substitutions from a BIDS directory
pub fn bids_autofind(bids_dir: &Path, modality: &str) -> Result<Autofind> {
    let pattern = match modality {
        "func" => r"(?:^|/)sub-(?P<sub>[^/]+)/ses-(?P<ses>[^/]+)/func/[^/]*?_trial-(?P<trial>[^/]+)\.nii\.gz$",
        "anat" => r"(?:^|/)sub-(?P<sub>[^/]+)/ses-(?P<ses>[^/]+)/anat/[^/]*?_(?P<trial>[^/]+)\.nii\.gz$",
        other => {
            return Err(PipelineError::Configuration(format!(
                "Modality must be one of {}, got {}",
                MODALITIES.join(", "),
                other
            )))
        }
    };
    let regex = compile(pattern)?;
    let bids_dir = existing_dir(bids_dir, "BIDS directory")?;
    let base = bids_dir.to_string_lossy();

    let path_template = format!(
        "{{data_dir}}/{}/{}/{}",
        subject_session_path("{subject}", "{session}"),
        modality,
        bids_filename("{subject}", "{session}", "{trial}", Some("trial"), None, NIFTI_GZ)
    );

    let mut substitutions = Vec::new();
    for (path, relative) in files_under(&bids_dir) {
        let Some(captures) = regex.captures(&relative) else {
            continue;
        };
        let substitution = Substitution {
            data_dir: base.to_string(),
            preprocessing_dir: String::new(),
            preprocessing_workdir: String::new(),
            l1_dir: String::new(),
            l1_workdir: String::new(),
            subject: captures["sub"].to_string(),
            session: captures["ses"].to_string(),
            trial: captures["trial"].to_string(),
        };

        let reconstructed = substitution.format(&path_template);
        if Path::new(&reconstructed) != path {
            tracing::warn!(
                found = %path.display(),
                reconstructed = %reconstructed,
                "File name does not follow the path template"
            );
        }
        substitutions.push(substitution);
    }

    tracing::info!(
        dir = %bids_dir.display(),
        modality,
        files = substitutions.len(),
        "BIDS files discovered"
    );
    Ok(Autofind {
        path_template,
        substitutions,
    })
}

/// Inputs listed by [`list_sources`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceQuery {
    /// Discover files of one modality below a BIDS directory
    Autofind { bids_dir: PathBuf, modality: String },
    /// Every (subject, session, trial) combination formatted into a template
    Combinations {
        path_template: String,
        data_dir: String,
        preprocessing_dir: String,
        dirs: PipelineDirs,
        subjects: Vec<String>,
        sessions: Vec<String>,
        trials: Vec<String>,
    },
}

/// Path template, its substitutions and the formatted sources
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceListing {
    pub path_template: String,
    pub substitutions: Vec<Substitution>,
    /// One path per substitution, or one glob per session with session grouping
    pub sources: Vec<String>,
}

/// Resolve a query to its substitutions and formatted source paths
///
/// Sources keep substitution order; duplicates (session grouping) are dropped.
pub fn list_sources(query: &SourceQuery, grouping: SourceGrouping) -> Result<SourceListing> {
    let (path_template, substitutions) = match query {
        SourceQuery::Autofind { bids_dir, modality } => {
            let found = bids_autofind(bids_dir, modality)?;
            (found.path_template, found.substitutions)
        }
        SourceQuery::Combinations {
            path_template,
            data_dir,
            preprocessing_dir,
            dirs,
            subjects,
            sessions,
            trials,
        } => {
            if subjects.is_empty() || sessions.is_empty() || trials.is_empty() {
                return Err(PipelineError::Configuration(
                    "Subjects, sessions and trials are all required with a path template".to_string(),
                ));
            }
            let substitutions = substitution_iterator(sessions, subjects, trials, data_dir, preprocessing_dir, dirs);
            (path_template.clone(), substitutions)
        }
    };

    let mut sources: Vec<String> = Vec::new();
    for substitution in &substitutions {
        let source = format_source(&path_template, substitution, grouping, None);
        if !sources.contains(&source) {
            sources.push(source);
        }
    }

    Ok(SourceListing {
        path_template,
        substitutions,
        sources,
    })
}

/// One first-level cope with its variance file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Level1Cope {
    pub subject: String,
    pub session: String,
    pub scan: String,
    pub cope: PathBuf,
    /// Sibling `…_varcb.nii.gz`, when present
    pub varcb: Option<PathBuf>,
}

/// Find `…_trial-<scan>_cope.nii.gz` files in a BIDS-layout level-1 tree
pub fn find_level1_copes(level1_dir: &Path) -> Result<Vec<Level1Cope>> {
    let regex = compile(
        r"(?:^|/)sub-(?P<sub>[^/]+)/ses-(?P<ses>[^/]+)/(?:[^/]+/)*[^/]*?_trial-(?P<scan>[^/]+)_cope\.nii\.gz$",
    )?;
    let level1_dir = existing_dir(level1_dir, "Level-1 directory")?;

    let copes: Vec<Level1Cope> = files_under(&level1_dir)
        .into_iter()
        .filter_map(|(path, relative)| {
            let captures = regex.captures(&relative)?;
            let file_name = path.file_name()?.to_string_lossy().replace("_cope.nii.gz", "_varcb.nii.gz");
            let varcb = path.with_file_name(file_name);
            Some(Level1Cope {
                subject: captures["sub"].to_string(),
                session: captures["ses"].to_string(),
                scan: captures["scan"].to_string(),
                varcb: varcb.is_file().then_some(varcb),
                cope: path,
            })
        })
        .collect();

    tracing::debug!(dir = %level1_dir.display(), copes = copes.len(), "Level-1 copes found");
    Ok(copes)
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| PipelineError::Configuration(format!("Invalid pattern: {}", e)))
}

fn existing_dir(dir: &Path, what: &str) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(mri_common::Error::NotFound(format!("{} {}", what, dir.display())).into());
    }
    Ok(dir.canonicalize()?)
}

/// Regular files below `dir` in name order, with their `/`-separated relative paths
fn files_under(dir: &Path) -> Vec<(PathBuf, String)> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Error accessing entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(dir).ok()?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            Some((entry.into_path(), relative))
        })
        .collect()
}
