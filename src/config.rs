/// Run configuration (JSON)
///
/// Every field has a default, so a partial file (or none at all) is valid.
/// Step parameters are not configured here; they travel with the saved
/// pipeline graph.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data::spectrum::DEFAULT_PPM0;
use crate::fitting::LcModelSettings;
use crate::steps::external::PluginSpec;
use crate::steps::StepRegistry;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Chemical shift assigned to 0 Hz
    pub ppm_reference: f64,
    /// Run every transition without waiting for a trigger
    pub autorun: bool,
    pub output_dir: PathBuf,
    /// External fitting; no fitting step when absent
    pub lcmodel: Option<LcModelSettings>,
    pub plugins: Vec<PluginSpec>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            ppm_reference: DEFAULT_PPM0,
            autorun: true,
            output_dir: PathBuf::from("mrs-output"),
            lcmodel: None,
            plugins: Vec::new(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Built-in steps plus the configured plugins
    pub fn registry(&self) -> StepRegistry {
        let mut registry = StepRegistry::with_builtin();
        for plugin in &self.plugins {
            registry.register_plugin(plugin.clone());
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(
            &path,
            r#"{ "autorun": false, "lcmodel": { "basis_file": "/basis/te30.basis" } }"#,
        )
        .unwrap();
        let config = RunConfig::load(&path).unwrap();
        assert!(!config.autorun);
        assert_eq!(config.ppm_reference, 4.7);
        let lcmodel = config.lcmodel.unwrap();
        assert_eq!(lcmodel.executable, "lcmodel");
        assert_eq!(lcmodel.basis_file, PathBuf::from("/basis/te30.basis"));
        assert_eq!(lcmodel.ppm_end, 4.0);
    }

    #[test]
    fn test_save_load_and_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let config = RunConfig {
            plugins: vec![PluginSpec {
                kind: "Denoise".to_string(),
                command: "denoise".to_string(),
                args: Vec::new(),
                parameters: Default::default(),
            }],
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = RunConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.registry().contains("Denoise"));
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(RunConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
