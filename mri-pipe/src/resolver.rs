//! Path resolver
//!
//! Maps a (condition, subject, scan type) tuple to exactly one scan
//! directory of a [`Selection`].

use crate::error::{PipelineError, Result};
use crate::selection::Selection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// What to do when several scans match one tuple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieBreak {
    /// Use the first match in catalog order and log the other candidates
    #[default]
    FirstInCatalogOrder,
    /// Fail with `AmbiguousScan`
    RejectAmbiguous,
}

impl FromStr for TieBreak {
    type Err = PipelineError;

    /// Accepts the `[execution] ambiguity` values `first` and `error`
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(Self::FirstInCatalogOrder),
            "error" | "strict" => Ok(Self::RejectAmbiguous),
            other => Err(PipelineError::Configuration(format!(
                "Unknown ambiguity policy '{}' (expected 'first' or 'error')",
                other
            ))),
        }
    }
}

/// Resolve one tuple to a scan directory
///
/// Fails with `ScanNotFound` iff no record matches.
pub fn resolve(
    selection: &Selection,
    condition: &str,
    subject: &str,
    scan_type: &str,
    tie_break: TieBreak,
) -> Result<PathBuf> {
    let matches = selection.matching(condition, subject, scan_type);

    let Some(first) = matches.first() else {
        return Err(PipelineError::scan_not_found(condition, subject, scan_type));
    };

    if matches.len() > 1 {
        match tie_break {
            TieBreak::FirstInCatalogOrder => {
                let candidates: Vec<String> = matches
                    .iter()
                    .map(|r| format!("{}/{}", r.measurement, r.scan))
                    .collect();
                tracing::warn!(
                    condition,
                    subject,
                    scan_type,
                    chosen = %candidates[0],
                    candidates = ?candidates,
                    "Several scans match, using the first in catalog order"
                );
            }
            TieBreak::RejectAmbiguous => {
                return Err(PipelineError::AmbiguousScan {
                    condition: condition.to_string(),
                    subject: subject.to_string(),
                    scan_type: scan_type.to_string(),
                    matches: matches.len(),
                });
            }
        }
    }

    Ok(first.path.clone())
}
