//! Bruker ParaVision metadata
//!
//! Reads the JCAMP-DX parameter files that ParaVision writes next to the
//! raw data (`subject`, `acqp`, `method`, `visu_pars`) and derives the
//! measurement identity, scan type and timing from them.
//!
//! # Format
//! ```text
//! ##$SUBJECT_id=( 60 )
//! <5502>
//! ##$PVM_RepetitionTime=1000
//! $$ comment line
//! ```
//! A `( dims )` value announces an array or string whose content follows on
//! the next line(s), up to the next `##` line.

use crate::error::{PipelineError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Files whose joint presence identifies a measurement directory
pub const MEASUREMENT_MARKER_FILES: [&str; 3] = ["AdjStatePerStudy", "ResultState", "subject"];

/// Per-measurement subject metadata file
pub const SUBJECT_FILE: &str = "subject";

/// One parameter value
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterValue {
    /// Array dimensions when the value was declared as `( dims )`
    pub dims: Option<Vec<usize>>,
    /// Value text, continuation lines joined by a single space
    pub raw: String,
}

/// Parsed parameter file
#[derive(Debug, Clone, Default)]
pub struct ParameterSet {
    values: BTreeMap<String, ParameterValue>,
}

impl ParameterSet {
    /// Parse parameter file content
    pub fn parse(content: &str) -> Self {
        let mut values = BTreeMap::new();
        let mut current: Option<(String, ParameterValue)> = None;

        for line in content.lines() {
            if line.starts_with("$$") {
                continue;
            }

            if let Some(rest) = line.strip_prefix("##") {
                if let Some((key, value)) = current.take() {
                    values.insert(key, value);
                }

                let rest = rest.strip_prefix('$').unwrap_or(rest);
                let Some((key, value)) = rest.split_once('=') else {
                    continue;
                };
                if key == "END" {
                    break;
                }

                let value = value.trim();
                let parameter = match parse_dims(value) {
                    Some(dims) => ParameterValue {
                        dims: Some(dims),
                        raw: String::new(),
                    },
                    None => ParameterValue {
                        dims: None,
                        raw: value.to_string(),
                    },
                };
                current = Some((key.trim().to_string(), parameter));
            } else if let Some((_, parameter)) = current.as_mut() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !parameter.raw.is_empty() {
                    parameter.raw.push(' ');
                }
                parameter.raw.push_str(line);
            }
        }

        if let Some((key, value)) = current {
            values.insert(key, value);
        }

        Self { values }
    }

    /// Read and parse a parameter file
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        // ParaVision writes Latin-1; lossy decoding keeps ASCII keys intact
        Ok(Self::parse(&String::from_utf8_lossy(&bytes)))
    }

    /// Raw value text
    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.raw.as_str())
    }

    /// Full parameter entry
    pub fn get(&self, key: &str) -> Option<&ParameterValue> {
        self.values.get(key)
    }

    /// String value with the `<...>` delimiters removed
    pub fn string(&self, key: &str) -> Option<String> {
        let raw = self.raw(key)?.trim();
        let unquoted = raw
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(raw)
            .trim();
        if unquoted.is_empty() {
            None
        } else {
            Some(unquoted.to_string())
        }
    }

    /// First numeric token of the value
    pub fn f64(&self, key: &str) -> Option<f64> {
        self.raw(key)?.split_whitespace().next()?.parse().ok()
    }

    /// First token as an unsigned integer
    pub fn u32(&self, key: &str) -> Option<u32> {
        self.raw(key)?.split_whitespace().next()?.parse().ok()
    }

    /// All numeric tokens of the value; `None` if any token is not numeric
    pub fn f64_array(&self, key: &str) -> Option<Vec<f64>> {
        self.raw(key)?
            .split_whitespace()
            .map(|t| t.parse().ok())
            .collect()
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no parameter was parsed
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parse `( 64 )` or `( 2, 3 )`; struct values such as `(3, <abc>)` are not dims
fn parse_dims(value: &str) -> Option<Vec<usize>> {
    let inner = value.strip_prefix('(')?.strip_suffix(')')?;
    inner
        .split(',')
        .map(|d| d.trim().parse::<usize>().ok())
        .collect()
}

/// Subject and condition of one measurement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementInfo {
    /// Animal / participant identifier (`SUBJECT_id`)
    pub subject: String,
    /// Experimental condition (`SUBJECT_study_name`)
    pub condition: String,
}

/// Read subject and condition from a measurement's `subject` file
///
/// Any missing piece is reported as `CatalogIncomplete` naming the
/// measurement directory.
pub fn read_measurement_info(measurement_dir: &Path) -> Result<MeasurementInfo> {
    let measurement = measurement_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| measurement_dir.display().to_string());
    let incomplete = |reason: String| PipelineError::CatalogIncomplete {
        measurement: measurement.clone(),
        reason,
    };

    let subject_file = measurement_dir.join(SUBJECT_FILE);
    if !subject_file.is_file() {
        return Err(incomplete(format!("missing {} file", SUBJECT_FILE)));
    }

    let params = ParameterSet::from_file(&subject_file)
        .map_err(|e| incomplete(format!("unreadable {} file: {}", SUBJECT_FILE, e)))?;

    let subject = params
        .string("SUBJECT_id")
        .ok_or_else(|| incomplete("no SUBJECT_id".to_string()))?;
    let condition = params
        .string("SUBJECT_study_name")
        .ok_or_else(|| incomplete("no SUBJECT_study_name".to_string()))?;

    Ok(MeasurementInfo { subject, condition })
}

/// Acquisition protocol name of one scan directory
///
/// `visu_pars` is preferred; `acqp` is the fallback for scans that were
/// never reconstructed.
pub fn read_scan_type(scan_dir: &Path) -> Option<String> {
    let candidates = [
        ("visu_pars", "VisuAcquisitionProtocol"),
        ("acqp", "ACQ_protocol_name"),
    ];

    candidates.iter().find_map(|(file, key)| {
        let path = scan_dir.join(file);
        if !path.is_file() {
            return None;
        }
        match ParameterSet::from_file(&path) {
            Ok(params) => params.string(key),
            Err(e) => {
                tracing::debug!(file = %path.display(), error = %e, "Unreadable parameter file");
                None
            }
        }
    })
}

/// Timing of one scan, in seconds
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanTiming {
    /// Volume repetition time
    pub repetition_time_s: Option<f64>,
    /// Number of dummy scans acquired before the first stored volume
    pub dummy_scans: u32,
    /// Delay between sequence start and the first stored volume
    pub total_delay_s: f64,
}

/// Read timing from a scan's `method` (preferred) and `acqp` files
pub fn read_scan_timing(scan_dir: &Path) -> Result<ScanTiming> {
    let method_path = scan_dir.join("method");
    let acqp_path = scan_dir.join("acqp");

    let method = method_path
        .is_file()
        .then(|| ParameterSet::from_file(&method_path))
        .transpose()?;
    let acqp = acqp_path
        .is_file()
        .then(|| ParameterSet::from_file(&acqp_path))
        .transpose()?;

    if method.is_none() && acqp.is_none() {
        return Err(PipelineError::Parameters {
            path: scan_dir.display().to_string(),
            reason: "neither method nor acqp present".to_string(),
        });
    }

    let repetition_time_ms = method
        .as_ref()
        .and_then(|m| m.f64("PVM_RepetitionTime"))
        .or_else(|| acqp.as_ref().and_then(|a| a.f64("ACQ_repetition_time")));

    let dummy_scans = method
        .as_ref()
        .and_then(|m| m.u32("PVM_DummyScans"))
        .unwrap_or(0);
    let dummy_duration_ms = method
        .as_ref()
        .and_then(|m| m.f64("PVM_DummyScansDur"))
        .unwrap_or(0.0);

    Ok(ScanTiming {
        repetition_time_s: repetition_time_ms.map(|ms| ms / 1000.0),
        dummy_scans,
        total_delay_s: dummy_duration_ms / 1000.0,
    })
}

/// Everything the `scan-info` node reports about a scan directory
#[derive(Debug, Clone, Serialize)]
pub struct ScanMetadata {
    pub scan_dir: PathBuf,
    pub scan_type: Option<String>,
    pub timing: ScanTiming,
}

/// Collect scan type and timing for one scan directory
pub fn read_scan_metadata(scan_dir: &Path) -> Result<ScanMetadata> {
    Ok(ScanMetadata {
        scan_dir: scan_dir.to_path_buf(),
        scan_type: read_scan_type(scan_dir),
        timing: read_scan_timing(scan_dir)?,
    })
}

/// True if `path` contains all measurement marker files
pub fn is_measurement_dir(path: &Path) -> bool {
    MEASUREMENT_MARKER_FILES
        .iter()
        .all(|marker| path.join(marker).exists())
}

/// Whether any ParaVision marker file is present
///
/// Directories without one (pipeline results, templates) are not measurements.
pub fn has_measurement_marker(path: &Path) -> bool {
    MEASUREMENT_MARKER_FILES
        .iter()
        .any(|marker| path.join(marker).exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBJECT: &str = "\
##TITLE=Parameter List, ParaVision 6.0.1
##JCAMPDX=4.24
$$ @vis= SUBJECT_id
##$SUBJECT_id=( 60 )
<5502>
##$SUBJECT_study_name=( 64 )
<ERC_ofM>
##$SUBJECT_weight=25
##END=
";

    #[test]
    fn test_parse_string_arrays() {
        let params = ParameterSet::parse(SUBJECT);
        assert_eq!(params.string("SUBJECT_id").as_deref(), Some("5502"));
        assert_eq!(params.string("SUBJECT_study_name").as_deref(), Some("ERC_ofM"));
        assert_eq!(params.get("SUBJECT_id").unwrap().dims, Some(vec![60]));
    }

    #[test]
    fn test_parse_scalars_and_title() {
        let params = ParameterSet::parse(SUBJECT);
        assert_eq!(params.f64("SUBJECT_weight"), Some(25.0));
        assert_eq!(params.raw("TITLE"), Some("Parameter List, ParaVision 6.0.1"));
    }

    #[test]
    fn test_parse_multiline_numeric_array() {
        let params = ParameterSet::parse("##$PVM_SpatResol=( 3 )\n0.2 0.2\n0.5\n##END=\n");
        assert_eq!(params.f64_array("PVM_SpatResol"), Some(vec![0.2, 0.2, 0.5]));
    }

    #[test]
    fn test_struct_value_is_not_dims() {
        let params = ParameterSet::parse("##$PVM_Fov=(3, <abc>)\n");
        let value = params.get("PVM_Fov").unwrap();
        assert!(value.dims.is_none());
        assert_eq!(value.raw, "(3, <abc>)");
    }

    #[test]
    fn test_empty_string_is_none() {
        let params = ParameterSet::parse("##$SUBJECT_id=( 60 )\n<>\n");
        assert_eq!(params.string("SUBJECT_id"), None);
    }

    #[test]
    fn test_comment_lines_are_ignored() {
        let params = ParameterSet::parse("##$A=1\n$$ a comment\n##$B=2\n");
        assert_eq!(params.len(), 2);
        assert_eq!(params.raw("A"), Some("1"));
    }
}
