//! Escape analysis configuration
//!
//! Settings come from three places, later ones overriding earlier ones:
//! the defaults, a JSON file (`--config` on the command line) and the
//! `PEA_*` environment variables.
//!
//! ```json
//! {
//!     "iterations": 3,
//!     "read_elimination": false
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscapeConfig {
    /// Run the escape analysis phases at all
    pub enabled: bool,

    /// Analyse-and-commit rounds per phase run; a round without changes stops early
    pub iterations: usize,

    /// Fixed-point bound for a single loop
    pub max_loop_iterations: usize,

    /// Run read elimination after partial escape analysis
    pub read_elimination: bool,

    /// Visits after which a loop is assumed to kill every location
    pub read_elimination_max_loop_visits: usize,

    /// Walk the computed schedule instead of the fixed node chain of each block
    pub use_schedule: bool,
}

impl Default for EscapeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            iterations: 2,
            max_loop_iterations: crate::phases::ea::MAX_LOOP_ITERATIONS,
            read_elimination: true,
            read_elimination_max_loop_visits: 5,
            use_schedule: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(msg) => write!(f, "IO error: {}", msg),
            ConfigError::ParseError(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl EscapeConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `PEA_DISABLE`, `PEA_ITERATIONS` and `PEA_NO_READ_ELIMINATION`
    pub fn with_env_overrides(mut self) -> Self {
        if std::env::var("PEA_DISABLE").is_ok() {
            self.enabled = false;
        }
        if let Ok(value) = std::env::var("PEA_ITERATIONS") {
            match value.parse() {
                Ok(iterations) => self.iterations = iterations,
                Err(_) => log::warn!("ignoring PEA_ITERATIONS={}: not a number", value),
            }
        }
        if std::env::var("PEA_NO_READ_ELIMINATION").is_ok() {
            self.read_elimination = false;
        }
        self
    }

    /// Parse a JSON config; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
