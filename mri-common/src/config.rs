//! Configuration loading and measurements root resolution
//!
//! Bootstrap configuration comes from a single TOML file. Every key is
//! optional; a missing file is not an error, the compiled defaults apply.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments
//! 2. Environment variables (`MRI_PIPE_CONFIG`, `MRI_PIPE_MEASUREMENTS_ROOT`)
//! 3. TOML configuration file
//! 4. Built-in defaults

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "MRI_PIPE_CONFIG";

/// Environment variable naming the measurements root
pub const MEASUREMENTS_ROOT_ENV_VAR: &str = "MRI_PIPE_MEASUREMENTS_ROOT";

/// Directory name used below the platform config dir and `/etc`
const CONFIG_DIR_NAME: &str = "mri-pipe";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    /// Root directory holding one subdirectory per measurement
    #[serde(default)]
    pub measurements_root: Option<PathBuf>,

    /// Base directory for work and result trees (defaults to the measurements root)
    #[serde(default)]
    pub workflow_base: Option<PathBuf>,

    /// CSV file mapping scan type to category (functional/structural)
    #[serde(default)]
    pub scan_classification: Option<PathBuf>,

    /// Registration target template
    #[serde(default)]
    pub template: Option<PathBuf>,

    /// Binary brain mask in template space (group-level statistics)
    #[serde(default)]
    pub mask: Option<PathBuf>,

    /// Pass-through settings for the external execution engine
    #[serde(default)]
    pub execution: ExecutionSection,

    /// Logging configuration (optional)
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[execution]` table
///
/// Values are kept as raw strings here; the planner validates them and
/// rejects unknown values before touching the filesystem.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExecutionSection {
    /// Engine plugin name (e.g. "MultiProc", "Linear")
    #[serde(default)]
    pub plugin: Option<String>,

    /// Worker pool size handed to the engine
    #[serde(default)]
    pub n_procs: Option<usize>,

    /// Image output type for FSL/AFNI nodes ("NIFTI" or "NIFTI_GZ")
    #[serde(default)]
    pub output_type: Option<String>,

    /// Tie-break policy when several scans match one selection tuple ("first" or "error")
    #[serde(default)]
    pub ambiguity: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse a TOML configuration file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Locate the configuration file
///
/// An explicit path (CLI flag, then `MRI_PIPE_CONFIG`) is returned as-is so
/// that a typo surfaces as an error. Otherwise the user config dir and
/// `/etc/mri-pipe/config.toml` are searched.
pub fn locate_config_file(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(expand_home(path));
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(expand_home(Path::new(&path)));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc").join(CONFIG_DIR_NAME).join("config.toml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Load the configuration, falling back to defaults when no file exists
///
/// An explicitly requested file that does not exist is reported as
/// `Error::NotFound`; a file that exists but does not parse is a
/// configuration error.
pub fn load_config(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match locate_config_file(cli_arg) {
        Some(path) if path.exists() => {
            info!("Loading configuration from {}", path.display());
            load_toml_config(&path)
        }
        Some(path) => Err(Error::NotFound(format!(
            "Configuration file {}",
            path.display()
        ))),
        None => {
            warn!("No configuration file found, using compiled defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Resolve the measurements root
///
/// Priority: command-line argument, `MRI_PIPE_MEASUREMENTS_ROOT`, TOML
/// `measurements_root`, current directory.
pub fn resolve_measurements_root(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        debug!("Measurements root from command line");
        return expand_home(path);
    }

    if let Ok(path) = std::env::var(MEASUREMENTS_ROOT_ENV_VAR) {
        if !path.trim().is_empty() {
            debug!("Measurements root from {}", MEASUREMENTS_ROOT_ENV_VAR);
            return expand_home(Path::new(&path));
        }
    }

    if let Some(path) = &config.measurements_root {
        debug!("Measurements root from TOML config");
        return expand_home(path);
    }

    PathBuf::from(".")
}

/// Expand a leading `~` to the user's home directory
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(stripped) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };

    match dirs::home_dir() {
        Some(home) => home.join(stripped),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(
            expand_home(Path::new("/data/NIdata")),
            PathBuf::from("/data/NIdata")
        );
    }

    #[test]
    fn test_expand_home_replaces_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/NIdata")), home.join("NIdata"));
        }
    }

    #[test]
    fn test_logging_default_level_is_info() {
        let logging = LoggingConfig::default();
        assert_eq!(logging.level, "info");
        assert!(logging.file.is_none());
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: TomlConfig = toml::from_str("").unwrap();
        assert!(config.measurements_root.is_none());
        assert!(config.execution.n_procs.is_none());
        assert_eq!(config.logging.level, "info");
    }
}
