//! Scan catalog
//!
//! Walks `<root>/<measurement>/<scan>` and turns every scan directory with
//! readable metadata into a [`ScanRecord`]. Measurements with incomplete
//! metadata are dropped with a warning; the build itself only fails when the
//! root cannot be read.
//!
//! Traversal is sorted by name (numeric names numerically), so catalog
//! insertion order is reproducible across runs and filesystems.

use crate::bruker::{has_measurement_marker, read_measurement_info, read_scan_type, MeasurementInfo};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Scan category from the classification table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanCategory {
    Functional,
    Structural,
}

impl ScanCategory {
    /// Parse a table value (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "functional" => Some(Self::Functional),
            "structural" => Some(Self::Structural),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClassificationRow {
    scan_type: String,
    categories: String,
}

/// Scan type → category table
///
/// CSV with header `scan_type,categories`. Scan types missing from the
/// table belong to neither default set.
#[derive(Debug, Clone, Default)]
pub struct ScanClassification {
    entries: Vec<(String, ScanCategory)>,
}

impl ScanClassification {
    /// Read the table from a CSV file
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            PipelineError::Configuration(format!(
                "Cannot open scan classification {}: {}",
                path.display(),
                e
            ))
        })?;
        let classification = Self::from_reader(file)?;
        tracing::info!(
            file = %path.display(),
            entries = classification.entries.len(),
            "Loaded scan classification"
        );
        Ok(classification)
    }

    /// Read the table from any CSV source
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut entries = Vec::new();
        for row in csv_reader.deserialize() {
            let row: ClassificationRow = row?;
            match ScanCategory::parse(&row.categories) {
                Some(category) => entries.push((row.scan_type, category)),
                None => tracing::warn!(
                    scan_type = %row.scan_type,
                    category = %row.categories,
                    "Unknown scan category, entry ignored"
                ),
            }
        }

        Ok(Self { entries })
    }

    /// Build a table from (scan type, category) pairs
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, ScanCategory)>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(t, c)| (t.into(), c)).collect(),
        }
    }

    /// Category of a scan type, if classified
    pub fn category(&self, scan_type: &str) -> Option<ScanCategory> {
        self.entries
            .iter()
            .find(|(t, _)| t == scan_type)
            .map(|(_, c)| *c)
    }

    /// Scan types of one category, in table order
    pub fn scan_types(&self, category: ScanCategory) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, c)| *c == category)
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One discovered scan directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanRecord {
    /// Measurement directory name
    pub measurement: String,
    pub condition: String,
    pub subject: String,
    pub scan_type: String,
    /// Scan subdirectory name (e.g. "7")
    pub scan: String,
    /// Category from the classification table
    pub category: Option<ScanCategory>,
    /// Absolute scan directory path
    pub path: PathBuf,
}

/// Measurement left out of the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedMeasurement {
    pub measurement: String,
    pub reason: String,
}

/// Index of all scans below a measurements root
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanCatalog {
    root: PathBuf,
    records: Vec<ScanRecord>,
    dropped: Vec<DroppedMeasurement>,
}

impl ScanCatalog {
    /// Scan a measurements root
    pub fn build(root: &Path, classification: &ScanClassification) -> Result<Self> {
        if !root.is_dir() {
            return Err(mri_common::Error::NotFound(format!(
                "Measurements root {}",
                root.display()
            ))
            .into());
        }
        let root = root.canonicalize()?;

        let mut catalog = Self {
            root: root.clone(),
            ..Default::default()
        };
        let mut current: Option<(String, MeasurementInfo)> = None;

        let walker = WalkDir::new(&root)
            .min_depth(1)
            .max_depth(2)
            .sort_by(|a, b| natural_cmp(a.file_name(), b.file_name()))
            .into_iter()
            .filter_entry(is_candidate_dir);

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                    continue;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.depth() == 1 {
                if !has_measurement_marker(entry.path()) {
                    tracing::debug!(dir = %name, "No measurement marker, skipped");
                    current = None;
                    continue;
                }
                current = match read_measurement_info(entry.path()) {
                    Ok(info) => {
                        tracing::debug!(
                            measurement = %name,
                            subject = %info.subject,
                            condition = %info.condition,
                            "Measurement found"
                        );
                        Some((name, info))
                    }
                    Err(e) => {
                        tracing::warn!(measurement = %name, error = %e, "Measurement dropped");
                        catalog.dropped.push(DroppedMeasurement {
                            measurement: name,
                            reason: e.to_string(),
                        });
                        None
                    }
                };
                continue;
            }

            let Some((measurement, info)) = current.as_ref() else {
                continue;
            };

            let Some(scan_type) = read_scan_type(entry.path()) else {
                tracing::debug!(
                    measurement = %measurement,
                    scan = %name,
                    "No scan type metadata, skipped"
                );
                continue;
            };

            catalog.records.push(ScanRecord {
                measurement: measurement.clone(),
                condition: info.condition.clone(),
                subject: info.subject.clone(),
                category: classification.category(&scan_type),
                scan_type,
                scan: name,
                path: entry.path().to_path_buf(),
            });
        }

        tracing::info!(
            root = %root.display(),
            scans = catalog.records.len(),
            dropped = catalog.dropped.len(),
            "Scan catalog built"
        );

        Ok(catalog)
    }

    /// Catalog over a fixed record list, in the given order
    pub fn from_records(root: impl Into<PathBuf>, records: Vec<ScanRecord>) -> Self {
        Self {
            root: root.into(),
            records,
            dropped: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Records in insertion order
    pub fn records(&self) -> &[ScanRecord] {
        &self.records
    }

    /// Measurements that could not be catalogued
    pub fn dropped(&self) -> &[DroppedMeasurement] {
        &self.dropped
    }

    pub fn contains(&self, record: &ScanRecord) -> bool {
        self.records.contains(record)
    }

    /// Distinct scan types, sorted
    pub fn scan_types(&self) -> BTreeSet<String> {
        self.records.iter().map(|r| r.scan_type.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Directories only; hidden entries and `*_work` output trees are skipped
fn is_candidate_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    entry.file_type().is_dir() && !name.starts_with('.') && !name.ends_with("_work")
}

/// Numeric names compare numerically and sort before non-numeric names
fn natural_cmp(a: &OsStr, b: &OsStr) -> Ordering {
    let a = a.to_string_lossy();
    let b = b.to_string_lossy();
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(&b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(&b),
    }
}
