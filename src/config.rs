//! Engine configuration.

use std::env;

use serde::{Deserialize, Serialize};

use crate::import::ImportConfig;

/// Configuration for a [`crate::engine::TmEngine`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Instance name, surfaced as the `origin` of translation matches.
    pub name: String,
    pub import: ImportConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            import: ImportConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Build a configuration from environment variables.
    ///
    /// `HTM_INSTANCE_NAME` sets the instance name; `HTM_BATCH_SIZE` the
    /// import batch size. Unset or unparseable values keep the defaults.
    pub fn from_environment() -> Self {
        let mut config = Self::default();
        if let Ok(name) = env::var("HTM_INSTANCE_NAME") {
            if !name.trim().is_empty() {
                config.name = name;
            }
        }
        if let Some(batch_size) = env::var("HTM_BATCH_SIZE")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            config.import.batch_size = batch_size;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.name, "default");
        assert_eq!(config.import.batch_size, 1000);
    }

    #[test]
    fn named_builder() {
        let config = EngineConfig::named("project-tm");
        assert_eq!(config.name, "project-tm");
    }
}
