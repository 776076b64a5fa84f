//! TOML service configuration.

use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use shared_logging::LogLevel;

use crate::{forest::ForestConfig, record::REPORT_COLLECTION};

/// Environment variable overriding `[server] bind`.
pub const BIND_ENV: &str = "REPORTCAST_BIND";
/// Environment variable overriding `[storage] path` (and selecting the JSONL store).
pub const STORE_PATH_ENV: &str = "REPORTCAST_STORE_PATH";

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Report store settings.
    pub storage: StorageConfig,
    /// Periodic refresh settings.
    pub refresh: RefreshConfig,
    /// Regressor settings.
    pub model: ModelConfig,
    /// Structured logs and events.
    pub telemetry: TelemetryConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
        }
    }
}

/// Backing store kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// In-process store; contents are lost on exit.
    Memory,
    /// JSON-lines files under `path`.
    Jsonl,
}

/// Report store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Store implementation.
    pub kind: StorageKind,
    /// Root directory of the JSONL store.
    pub path: PathBuf,
    /// Collection holding test reports.
    pub collection: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::Jsonl,
            path: PathBuf::from("data/reports"),
            collection: REPORT_COLLECTION.into(),
        }
    }
}

/// Periodic refresh settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Seconds between refresh cycles.
    pub interval_secs: u64,
}

impl RefreshConfig {
    /// Interval as a [`Duration`].
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: 24 * 60 * 60,
        }
    }
}

/// Regressor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Trees in the forest.
    pub trees: usize,
    /// Maximum tree depth.
    pub max_depth: usize,
    /// Minimum samples needed to split a node.
    pub min_samples_split: usize,
    /// Bootstrap seed; entropy when absent.
    pub seed: Option<u64>,
    /// Where the trained model is saved and reloaded from.
    pub artifact_path: Option<PathBuf>,
}

impl ModelConfig {
    /// Forest hyperparameters.
    #[must_use]
    pub const fn forest(&self) -> ForestConfig {
        ForestConfig {
            trees: self.trees,
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            seed: self.seed,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        let forest = ForestConfig::default();
        Self {
            trees: forest.trees,
            max_depth: forest.max_depth,
            min_samples_split: forest.min_samples_split,
            seed: forest.seed,
            artifact_path: None,
        }
    }
}

/// Structured log and event sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// JSON-lines log file.
    pub log_path: Option<PathBuf>,
    /// JSON-lines event log.
    pub event_log: Option<PathBuf>,
    /// Lowest level written to `log_path`.
    pub log_level: LogLevel,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            event_log: None,
            log_level: LogLevel::Info,
        }
    }
}

impl ServiceConfig {
    /// Loads a TOML file, resolving relative paths against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading service config {}", path.display()))?;
        let mut config = Self::from_toml(&raw).with_context(|| format!("parsing {}", path.display()))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.resolve_relative(&base);
        Ok(config)
    }

    /// Parses and validates a TOML string.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.refresh.interval_secs == 0 {
            bail!("refresh.interval_secs must be greater than zero");
        }
        if self.model.trees == 0 {
            bail!("model.trees must be greater than zero");
        }
        if self.model.max_depth == 0 {
            bail!("model.max_depth must be greater than zero");
        }
        if self.storage.collection.trim().is_empty() {
            bail!("storage.collection must not be empty");
        }
        Ok(())
    }

    /// Applies `REPORTCAST_BIND` and `REPORTCAST_STORE_PATH` when set.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(env::var(BIND_ENV).ok(), env::var(STORE_PATH_ENV).ok())
    }

    fn apply_overrides(&mut self, bind: Option<String>, store_path: Option<String>) -> Result<()> {
        if let Some(bind) = bind {
            self.server.bind = bind
                .parse()
                .with_context(|| format!("{BIND_ENV}=`{bind}` is not a socket address"))?;
        }
        if let Some(store_path) = store_path {
            self.storage.kind = StorageKind::Jsonl;
            self.storage.path = PathBuf::from(store_path);
        }
        Ok(())
    }

    fn resolve_relative(&mut self, base: &Path) {
        let resolve = |candidate: &mut PathBuf| {
            if candidate.is_relative() {
                *candidate = base.join(&*candidate);
            }
        };
        resolve(&mut self.storage.path);
        if let Some(path) = self.model.artifact_path.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.telemetry.log_path.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.telemetry.event_log.as_mut() {
            resolve(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ServiceConfig::from_toml("").unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.refresh.interval(), Duration::from_secs(86_400));
        assert_eq!(config.storage.kind, StorageKind::Jsonl);
        assert_eq!(config.storage.path, PathBuf::from("data/reports"));
        assert_eq!(config.storage.collection, "test_reports");
        assert_eq!(config.model.forest(), ForestConfig::default());
    }

    #[test]
    fn parses_sections() {
        let config = ServiceConfig::from_toml(
            r#"
            [server]
            bind = "0.0.0.0:9000"

            [storage]
            kind = "jsonl"
            path = "/var/lib/reportcast"

            [refresh]
            interval_secs = 60

            [model]
            trees = 10
            seed = 7

            [telemetry]
            log_level = "WARN"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind.port(), 9000);
        assert_eq!(config.storage.kind, StorageKind::Jsonl);
        assert_eq!(config.refresh.interval_secs, 60);
        assert_eq!(config.model.forest().trees, 10);
        assert_eq!(config.model.seed, Some(7));
        assert_eq!(config.telemetry.log_level, LogLevel::Warn);
    }

    #[test]
    fn rejects_zero_interval_and_trees() {
        assert!(ServiceConfig::from_toml("[refresh]\ninterval_secs = 0").is_err());
        assert!(ServiceConfig::from_toml("[model]\ntrees = 0").is_err());
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("reportcast.toml");
        fs::write(
            &path,
            "[storage]\nkind = \"jsonl\"\npath = \"reports\"\n[model]\nartifact_path = \"model.json\"\n",
        )
        .unwrap();
        let config = ServiceConfig::load(&path).unwrap();
        assert_eq!(config.storage.path, dir.path().join("reports"));
        assert_eq!(
            config.model.artifact_path,
            Some(dir.path().join("model.json"))
        );
    }

    #[test]
    fn overrides_switch_to_jsonl_store() {
        let mut config = ServiceConfig::default();
        config
            .apply_overrides(Some("0.0.0.0:8080".into()), Some("/tmp/reports".into()))
            .unwrap();
        assert_eq!(config.server.bind.port(), 8080);
        assert_eq!(config.storage.kind, StorageKind::Jsonl);
        assert!(config
            .apply_overrides(Some("not-an-addr".into()), None)
            .is_err());
    }
}
