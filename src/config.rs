use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::artifact::Artifact;
use crate::dependency::Dependency;
use crate::source::SourceSpec;


#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("invalid configuration in {0}: {1}")]
    Parse(PathBuf, serde_yaml::Error),
}


/// Settings for a `roost` worker process, usually read from YAML.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Scopes every status key, so several managers can share one store.
    pub manager_id: String,
    pub poll: PollConfig,
    pub cache: CacheConfig,
    /// redb file holding statuses; statuses stay in memory when unset.
    pub status_db: Option<PathBuf>,
    /// Rows per batch yielded by the catalog source.
    pub batch_rows: usize,
    pub artifacts: BTreeMap<Artifact, SourceSpec>,
    pub dependencies: Vec<Dependency>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager_id: "default".to_string(),
            poll: PollConfig::default(),
            cache: CacheConfig::default(),
            status_db: None,
            batch_rows: 1024,
            artifacts: BTreeMap::new(),
            dependencies: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Read(path.to_path_buf(), err))?;
        serde_yaml::from_str(&text).map_err(|err| ConfigError::Parse(path.to_path_buf(), err))
    }
}


/// Remote poll loop parameters: wait `interval_ms` between status reads and
/// reclaim the task after `max_polls` reads that still show it PROCESSING.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_polls: u32,
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { interval_ms: 1000, max_polls: 100 }
    }
}


#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub extension: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("cache"), extension: "jsonl".to_string() }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::TaskKind;

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.manager_id, "default");
        assert_eq!(config.poll, PollConfig { interval_ms: 1000, max_polls: 100 });
        assert_eq!(config.cache.extension, "jsonl");
        assert!(config.status_db.is_none());
    }

    #[test]
    fn parses_catalog_and_dependencies() {
        let config: Config = serde_yaml::from_str(
            r#"
manager_id: analytics
poll:
  interval_ms: 250
cache:
  dir: /var/cache/roost
artifacts:
  abc123:
    rows:
      - { id: 1 }
      - { id: 2 }
  def456:
    file: data/def456.jsonl
dependencies:
  - producer: { artifact: abc123, kind: to_cache }
    consumer: { artifact: def456, kind: schema }
"#,
        )
        .unwrap();

        assert_eq!(config.poll.interval(), Duration::from_millis(250));
        assert_eq!(config.poll.max_polls, 100);
        assert_eq!(config.cache.dir, PathBuf::from("/var/cache/roost"));

        let abc = Artifact::new("abc123").unwrap();
        assert!(matches!(&config.artifacts[&abc], SourceSpec::Rows { rows } if rows.len() == 2));
        assert_eq!(config.dependencies.len(), 1);
        assert_eq!(config.dependencies[0].consumer.kind, TaskKind::SCHEMA);
    }

    #[test]
    fn rejects_unsafe_artifact_ids() {
        let parsed = serde_yaml::from_str::<Config>("artifacts:\n  ../x:\n    rows: []\n");
        assert!(parsed.is_err());
    }
}
