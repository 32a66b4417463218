//! Daemon configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;

/// meterd configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// State directory (pid lock file)
    pub state_dir: PathBuf,
    /// Control channel listen address
    pub control_listen: String,
    /// Trace file to replay; live capture backends attach externally
    pub trace: Option<PathBuf>,
    /// Rule files (JSON arrays of parsed rules) loaded at startup
    pub rule_files: Vec<PathBuf>,
    /// Engine settings
    pub engine: EngineConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/run/meterd"),
            control_listen: "127.0.0.1:8745".into(),
            trace: None,
            rule_files: Vec::new(),
            engine: EngineConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load from a JSON file.
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_roundtrip() {
        let cfg = DaemonConfig::default();
        assert!(cfg.trace.is_none());
        let json = serde_json::to_string(&cfg).unwrap();
        let back: DaemonConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.control_listen, cfg.control_listen);
    }

    #[test]
    fn test_partial_config_errors_cleanly() {
        let dir = std::env::temp_dir().join("meter-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(DaemonConfig::load(path.to_str().unwrap()).is_err());
    }
}
