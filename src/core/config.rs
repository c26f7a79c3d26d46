//! Engine configuration: work directory, tile repository, timing knobs.
//!
//! Loaded from an optional YAML file; CLI flags are layered on top by the
//! caller. Every field has a default so an empty file is valid.

use super::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct EngineConfig {
    /// Root under which each run gets its own directory
    pub work_home: PathBuf,

    /// Local tile repository (`<repo>/<name>/<version>/tile-spec.yaml`)
    pub tile_repo: PathBuf,

    /// Dependency wait poll interval
    pub poll_interval_ms: u64,

    /// Settle time after applying application manifests
    pub settle_seconds: u64,

    /// Executable invoked by generated probe wrappers. Defaults to this binary.
    pub probe_binary: Option<PathBuf>,

    /// Interpreter for generated stage scripts
    pub shell: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_home: PathBuf::from("/tmp/dice"),
            tile_repo: PathBuf::from("./tiles"),
            poll_interval_ms: 5000,
            settle_seconds: 10,
            probe_binary: None,
            shell: "bash".to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// Load a config file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Self::from_yaml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    /// The probe executable, falling back to the current binary.
    pub fn probe_command(&self) -> String {
        self.probe_binary
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "dice".to_string())
    }

    /// Directory that holds everything a single run writes.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.work_home.join("runs").join(run_id)
    }
}
