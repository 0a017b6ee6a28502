//! User configuration.
//!
//! A small TOML file can set defaults for the command line tool:
//!
//! ```toml
//! # Parent directory for per-archive scratch directories
//! scratch_dir = "/var/tmp"
//!
//! # CRIU image tool used to explore process trees
//! crit_binary = "/usr/bin/crit"
//!
//! # Default output format: "tree" or "json"
//! format = "json"
//!
//! # Directories `list` searches for checkpoint-* archives
//! checkpoint_dirs = ["/var/lib/kubelet/checkpoints", "/srv/checkpoints"]
//! ```
//!
//! The first existing file of the following is used:
//! - `$CKPT_RS_CONFIG`
//! - `$XDG_CONFIG_HOME/ckpt-rs/config.toml` (or `~/.config/ckpt-rs/config.toml`)
//! - `/etc/ckpt-rs/config.toml`
//!
//! Missing files are not an error; defaults apply.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::crit::DEFAULT_CRIT_BINARY;
use crate::error::{CheckpointError, Result};
use crate::listing::DEFAULT_CHECKPOINT_DIR;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "CKPT_RS_CONFIG";

/// System-wide configuration file.
pub const SYSTEM_CONFIG: &str = "/etc/ckpt-rs/config.toml";

/// Output format for reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Tree,
    Json,
}

/// Tool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Parent of scratch directories; the system temp dir if unset.
    pub scratch_dir: Option<PathBuf>,

    /// `crit` binary used by the process tree explorer.
    pub crit_binary: PathBuf,

    /// Default output format.
    pub format: ReportFormat,

    /// Directories searched by `list` before any given on the command line.
    pub checkpoint_dirs: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scratch_dir: None,
            crit_binary: PathBuf::from(DEFAULT_CRIT_BINARY),
            format: ReportFormat::Tree,
            checkpoint_dirs: vec![PathBuf::from(DEFAULT_CHECKPOINT_DIR)],
        }
    }
}

impl Config {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|source| CheckpointError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the first configuration file found in the standard locations.
    pub fn discover() -> Result<Self> {
        Self::discover_in(&candidate_paths(|key| std::env::var_os(key)))
    }

    /// Load the first existing file of `candidates`, or the defaults.
    pub fn discover_in(candidates: &[PathBuf]) -> Result<Self> {
        for path in candidates {
            if path.is_file() {
                tracing::debug!(path = %path.display(), "loading configuration");
                return Self::load(path);
            }
        }
        Ok(Self::default())
    }
}

/// Configuration file locations in search order, given an environment lookup.
pub fn candidate_paths<F>(env: F) -> Vec<PathBuf>
where
    F: Fn(&str) -> Option<OsString>,
{
    let mut paths = Vec::new();
    if let Some(explicit) = env(CONFIG_ENV).filter(|v| !v.is_empty()) {
        paths.push(PathBuf::from(explicit));
    }
    if let Some(xdg) = env("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        paths.push(PathBuf::from(xdg).join("ckpt-rs/config.toml"));
    } else if let Some(home) = env("HOME").filter(|v| !v.is_empty()) {
        paths.push(PathBuf::from(home).join(".config/ckpt-rs/config.toml"));
    }
    paths.push(PathBuf::from(SYSTEM_CONFIG));
    paths
}
