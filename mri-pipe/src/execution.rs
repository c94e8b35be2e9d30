//! Execution engine settings
//!
//! Everything the external engine needs is carried in an explicit
//! [`ExecutionConfig`] value that every assembly call receives and every
//! exported plan embeds. The `[execution]` table is first checked into
//! [`ExecutionSettings`], which needs no paths, so that bad values fail
//! before the measurements root is touched.

use crate::error::{PipelineError, Result};
use crate::resolver::TieBreak;
use mri_common::config::ExecutionSection;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Plugins the engine is known to provide
pub const KNOWN_PLUGINS: [&str; 7] = ["Linear", "MultiProc", "SGE", "PBS", "SLURM", "Condor", "LSF"];

/// Default engine plugin
pub const DEFAULT_PLUGIN: &str = "MultiProc";

/// Image format written by FSL and AFNI nodes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputType {
    #[serde(rename = "NIFTI")]
    Nifti,
    #[default]
    #[serde(rename = "NIFTI_GZ")]
    NiftiGz,
}

impl OutputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nifti => "NIFTI",
            Self::NiftiGz => "NIFTI_GZ",
        }
    }
}

impl FromStr for OutputType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NIFTI" => Ok(Self::Nifti),
            "NIFTI_GZ" => Ok(Self::NiftiGz),
            other => Err(PipelineError::Configuration(format!(
                "Unknown output type '{}' (expected NIFTI or NIFTI_GZ)",
                other
            ))),
        }
    }
}

/// Checked `[execution]` values, independent of any directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSettings {
    pub plugin: String,
    pub n_procs: usize,
    pub output_type: OutputType,
    pub tie_break: TieBreak,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            plugin: DEFAULT_PLUGIN.to_string(),
            n_procs: default_n_procs(),
            output_type: OutputType::default(),
            tie_break: TieBreak::default(),
        }
    }
}

impl ExecutionSettings {
    /// Parse the `[execution]` table, rejecting unknown values
    pub fn from_section(section: &ExecutionSection) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(plugin) = &section.plugin {
            if !KNOWN_PLUGINS.contains(&plugin.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "Unknown execution plugin '{}' (expected one of {})",
                    plugin,
                    KNOWN_PLUGINS.join(", ")
                )));
            }
            settings.plugin = plugin.clone();
        }
        if let Some(n_procs) = section.n_procs {
            settings = settings.with_n_procs(n_procs)?;
        }
        if let Some(output_type) = &section.output_type {
            settings.output_type = output_type.parse()?;
        }
        if let Some(ambiguity) = &section.ambiguity {
            settings.tie_break = ambiguity.parse()?;
        }

        Ok(settings)
    }

    /// Override the worker count; zero is rejected
    pub fn with_n_procs(mut self, n_procs: usize) -> Result<Self> {
        if n_procs == 0 {
            return Err(PipelineError::Configuration(
                "n_procs must be at least 1".to_string(),
            ));
        }
        self.n_procs = n_procs;
        Ok(self)
    }

    /// Engine configuration rooted at `base_dir`
    pub fn into_config(self, base_dir: impl Into<PathBuf>) -> ExecutionConfig {
        ExecutionConfig {
            plugin: self.plugin,
            n_procs: self.n_procs,
            output_type: self.output_type,
            base_dir: base_dir.into(),
        }
    }
}

/// Engine configuration handed to every assembly call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionConfig {
    pub plugin: String,
    pub n_procs: usize,
    pub output_type: OutputType,
    /// Engine working directory
    pub base_dir: PathBuf,
}

impl ExecutionConfig {
    /// Defaults: MultiProc, all but two cores, compressed NIfTI
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        ExecutionSettings::default().into_config(base_dir)
    }

    /// Override the worker count; zero is rejected
    pub fn with_n_procs(mut self, n_procs: usize) -> Result<Self> {
        if n_procs == 0 {
            return Err(PipelineError::Configuration(
                "n_procs must be at least 1".to_string(),
            ));
        }
        self.n_procs = n_procs;
        Ok(self)
    }

    /// `plugin_args` as the engine expects them
    pub fn plugin_args(&self) -> serde_json::Value {
        serde_json::json!({ "n_procs": self.n_procs })
    }
}

/// Available cores minus two, but never fewer than two
pub fn default_n_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(2)
        .max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExecutionConfig::new("/tmp/work");
        assert_eq!(config.plugin, "MultiProc");
        assert!(config.n_procs >= 2);
        assert_eq!(config.output_type, OutputType::NiftiGz);
    }

    #[test]
    fn test_from_section() {
        let section = ExecutionSection {
            plugin: Some("Linear".to_string()),
            n_procs: Some(6),
            output_type: Some("nifti".to_string()),
            ambiguity: Some("error".to_string()),
        };
        let settings = ExecutionSettings::from_section(&section).unwrap();
        assert_eq!(settings.tie_break, TieBreak::RejectAmbiguous);

        let config = settings.into_config("/tmp");
        assert_eq!(config.plugin, "Linear");
        assert_eq!(config.n_procs, 6);
        assert_eq!(config.output_type, OutputType::Nifti);
        assert_eq!(config.plugin_args()["n_procs"], 6);
    }

    #[test]
    fn test_unknown_values_are_configuration_errors() {
        let section = ExecutionSection {
            output_type: Some("ANALYZE".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            ExecutionSettings::from_section(&section),
            Err(PipelineError::Configuration(_))
        ));

        let section = ExecutionSection {
            plugin: Some("Threads".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            ExecutionSettings::from_section(&section),
            Err(PipelineError::Configuration(_))
        ));

        let section = ExecutionSection {
            ambiguity: Some("bogus".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            ExecutionSettings::from_section(&section),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_procs_rejected() {
        assert!(ExecutionConfig::new("/tmp").with_n_procs(0).is_err());
        assert!(ExecutionSettings::default().with_n_procs(0).is_err());
    }
}
