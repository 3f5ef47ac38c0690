//! Engine settings, read from the `[engine]` table of a TOML file.
//!
//! ```toml
//! [engine]
//! admin_role = "admin"
//! max_nesting_depth = 8
//! expression_cache_capacity = 1024
//! delete_flag = "_delete"
//! ```

use crate::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Holders of this role bypass permission checks and transition roles.
    pub admin_role: String,
    /// Deepest relation nesting a write payload may use.
    pub max_nesting_depth: usize,
    /// Parsed expressions kept in the evaluator's LRU cache.
    pub expression_cache_capacity: usize,
    /// Child-item key that marks the item for deletion.
    pub delete_flag: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admin_role: "admin".to_string(),
            max_nesting_depth: 8,
            expression_cache_capacity: 1024,
            delete_flag: "_delete".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    engine: EngineConfig,
}

impl EngineConfig {
    /// Parses a TOML document. A missing `[engine]` table yields defaults.
    pub fn from_toml_str(contents: &str) -> EngineResult<Self> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(file.engine)
    }

    /// Loads settings from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            info!("No engine config at {:?}, using defaults", path);
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(config) => {
                    info!("Loaded engine config from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse engine config {:?}: {}. Using defaults.", path, e);
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read engine config {:?}: {}", path, e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_keeps_other_defaults() {
        let config = EngineConfig::from_toml_str("[engine]\nadmin_role = \"root\"\n").unwrap();
        assert_eq!(config.admin_role, "root");
        assert_eq!(config.max_nesting_depth, 8);
        assert_eq!(config.delete_flag, "_delete");
    }

    #[test]
    fn missing_table_is_default() {
        assert_eq!(EngineConfig::from_toml_str("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("[engine\n"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("nope.toml"));
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        std::fs::write(&path, "[engine]\nmax_nesting_depth = 3\ndelete_flag = \"$remove\"\n").unwrap();
        let config = EngineConfig::load_from(&path);
        assert_eq!(config.max_nesting_depth, 3);
        assert_eq!(config.delete_flag, "$remove");
    }

    #[test]
    fn unparseable_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.toml");
        std::fs::write(&path, "engine = 5").unwrap();
        assert_eq!(EngineConfig::load_from(&path), EngineConfig::default());
    }
}
