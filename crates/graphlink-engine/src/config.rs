//! Engine configuration, loaded from TOML.

use crate::pseudo::{EngineOptions, PseudoEngine};
use crate::topology::{Topology, TopologyError};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_LISTEN: &str = "tcp://127.0.0.1:7400";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// ```toml
/// listen = "ws://0.0.0.0:7400"
/// echo_pairs = 4
/// wait_for_all_externals = true
/// allowed_owners = ["alice", "bob"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// `tcp://host:port` or `ws://host:port`.
    pub listen: String,
    /// Number of `int{i}`/`ext{i}` device pairs in the echo graph.
    pub echo_pairs: usize,
    /// Replaces the generated `echo_{n}` instance id.
    pub graph_instance: Option<String>,
    pub wait_for_all_externals: bool,
    /// Empty admits any owner.
    pub allowed_owners: BTreeSet<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            echo_pairs: 1,
            graph_instance: None,
            wait_for_all_externals: false,
            allowed_owners: BTreeSet::new(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.echo_pairs == 0 {
            return Err(ConfigError::Invalid("echo_pairs must be at least 1".into()));
        }
        if self.graph_instance.as_deref() == Some("") {
            return Err(ConfigError::Invalid("graph_instance must not be empty".into()));
        }
        Ok(())
    }

    /// Build the echo engine this configuration describes.
    pub fn build_engine(&self) -> Result<PseudoEngine, ConfigError> {
        self.validate()?;
        let mut topology = Topology::echo(self.echo_pairs)?;
        if let Some(instance) = &self.graph_instance {
            topology.set_graph_instance(instance);
        }
        let options = EngineOptions {
            allowed_owners: self.allowed_owners.clone(),
            wait_for_all_externals: self.wait_for_all_externals,
        };
        Ok(PseudoEngine::new(topology, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(EngineConfig::from_toml("").unwrap(), EngineConfig::default());
    }

    #[test]
    fn full_file() {
        let config = EngineConfig::from_toml(
            r#"
            listen = "ws://0.0.0.0:9000"
            echo_pairs = 3
            graph_instance = "bench"
            wait_for_all_externals = true
            allowed_owners = ["alice"]
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "ws://0.0.0.0:9000");
        assert_eq!(config.echo_pairs, 3);
        assert!(config.wait_for_all_externals);
        assert!(config.allowed_owners.contains("alice"));
        assert!(config.build_engine().is_ok());
    }

    #[test]
    fn rejects_bad_files() {
        assert!(matches!(
            EngineConfig::from_toml("echo_pairs = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml("echo_pares = 2"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::load(Path::new("/nonexistent/graphlink.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
