#![forbid(unsafe_code)]

use crate::store::IndexError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_STORAGE_DIR: &str = "ANNOGRAPH_STORAGE_DIR";
pub const ENV_LOCK_WAIT_MS: &str = "ANNOGRAPH_LOCK_WAIT_MS";
pub const ENV_BUSY_TIMEOUT_MS: &str = "ANNOGRAPH_BUSY_TIMEOUT_MS";
pub const ENV_GROUPING: &str = "ANNOGRAPH_GROUPING";

/// What one occurrence vertex aggregates over, besides its tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingKey {
    #[default]
    Document,
    Collection,
}

impl GroupingKey {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Collection => "collection",
        }
    }
}

impl fmt::Display for GroupingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupingKey {
    type Err = IndexError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "document" => Ok(Self::Document),
            "collection" => Ok(Self::Collection),
            other => Err(IndexError::Config(format!("unknown grouping key '{other}'"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    pub storage_dir: PathBuf,
    pub db_file_name: String,
    pub busy_timeout_ms: u64,
    /// Upper bound on waiting for another merge of the same tagset.
    pub lock_wait_ms: u64,
    pub grouping: GroupingKey,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from(".annograph"),
            db_file_name: "annograph.db".to_string(),
            busy_timeout_ms: 5_000,
            lock_wait_ms: 10_000,
            grouping: GroupingKey::Document,
        }
    }
}

impl IndexConfig {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, IndexError> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Applies `ANNOGRAPH_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, IndexError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, IndexError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = non_empty(lookup(ENV_STORAGE_DIR)) {
            self.storage_dir = PathBuf::from(dir);
        }
        if let Some(raw) = non_empty(lookup(ENV_LOCK_WAIT_MS)) {
            self.lock_wait_ms = parse_ms(ENV_LOCK_WAIT_MS, &raw)?;
        }
        if let Some(raw) = non_empty(lookup(ENV_BUSY_TIMEOUT_MS)) {
            self.busy_timeout_ms = parse_ms(ENV_BUSY_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = non_empty(lookup(ENV_GROUPING)) {
            self.grouping = raw.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join(&self.db_file_name)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    fn validate(&self) -> Result<(), IndexError> {
        let name = self.db_file_name.trim();
        if name.is_empty() {
            return Err(IndexError::Config("db_file_name must not be empty".to_string()));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(IndexError::Config(
                "db_file_name must be a bare file name".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_ms(key: &str, raw: &str) -> Result<u64, IndexError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| IndexError::Config(format!("{key} must be a non-negative integer, got '{raw}'")))
}
