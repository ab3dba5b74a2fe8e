//! Runtime configuration

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::aggregate::TOP_TEACHERS;

/// Where a command reads its records from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Seeded demo dataset
    #[default]
    Generated,
    /// Directory with the three CSV files
    Csv { dir: PathBuf },
    /// Backend-style JSON payload
    Json { path: PathBuf },
    /// Tables in the `DATABASE_URL` Postgres instance
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Seed for the generated dataset
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Rows in the "top teachers" chart
    #[serde(default = "default_top_n")]
    pub top_n: usize,

    #[serde(default)]
    pub source: SourceConfig,

    /// Postgres URL; `DATABASE_URL` overrides it
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            top_n: default_top_n(),
            source: SourceConfig::default(),
            database_url: None,
        }
    }
}

fn default_seed() -> u64 {
    2026
}

fn default_top_n() -> usize {
    TOP_TEACHERS
}

impl Config {
    /// Reads `path` if given, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }
        Ok(config)
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.seed, 2026);
        assert_eq!(config.top_n, 10);
        assert_eq!(config.source, SourceConfig::Generated);
    }

    #[test]
    fn reads_tagged_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("insights.json");
        std::fs::write(
            &path,
            r#"{ "seed": 9, "source": { "kind": "csv", "dir": "exports" } }"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.source, SourceConfig::Csv { dir: PathBuf::from("exports") });
    }
}
