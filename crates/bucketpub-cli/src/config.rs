//! Configuration loading from TOML files

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bucketpub_core::BatchConfig;
use clap::ValueEnum;
use serde::Deserialize;

/// Global configuration for bucketpub
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub metadata: MetadataConfig,
    pub bus: BusConfig,
    pub batch: BatchSection,
    pub parser: ParserConfig,
    pub http: HttpSection,
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// `<root>/<bucket>/<object>` on local disk
    #[default]
    Filesystem,
    /// Cloud Storage JSON API
    Gcs,
    /// Object id is a URL, or a path under `base_url`
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub root: PathBuf,
    /// Cloud Storage endpoint override
    pub endpoint: Option<String>,
    pub base_url: Option<String>,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub token: Option<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Filesystem,
            root: PathBuf::from("."),
            endpoint: None,
            base_url: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataKind {
    #[default]
    None,
    Gcs,
    Static,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub kind: MetadataKind,
    pub endpoint: Option<String>,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub token: Option<String>,
    /// Entries for `kind = "static"`
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Append messages to a local file, one per line
    Ndjson,
    /// Dry run: log window sizes only
    #[default]
    Log,
    /// POST each window as a JSON array
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub kind: BusKind,
    pub path: PathBuf,
    pub url: Option<String>,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub token: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Log,
            path: PathBuf::from("messages.ndjson"),
            url: None,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub max_records: usize,
    pub max_latency_ms: u64,
    pub max_in_flight: usize,
}

impl Default for BatchSection {
    fn default() -> Self {
        let defaults = BatchConfig::default();
        Self {
            max_records: defaults.max_records,
            max_latency_ms: defaults.max_latency.as_millis() as u64,
            max_in_flight: defaults.max_in_flight,
        }
    }
}

impl BatchSection {
    pub fn to_batch_config(self) -> BatchConfig {
        BatchConfig {
            max_records: self.max_records,
            max_latency: Duration::from_millis(self.max_latency_ms),
            max_in_flight: self.max_in_flight,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub array_path: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            array_path: "results.*".to_string(),
        }
    }
}

/// Seconds, as written in the file
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub read_timeout: u64,
    pub connect_timeout: u64,
    pub max_retries: u32,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            read_timeout: 10,
            connect_timeout: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub default: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            default: cpus.min(8),
        }
    }
}

/// Deserialize a string that may be an environment reference like `${VAR}`
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.and_then(|s| expand_env_var(&s)))
}

/// `${VAR}` → value of `VAR` (None when unset); anything else is literal
fn expand_env_var(s: &str) -> Option<String> {
    match s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(var_name) => std::env::var(var_name).ok(),
        None => Some(s.to_string()),
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./bucketpub.toml (current directory)
    /// 2. <config dir>/bucketpub/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("bucketpub.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(dirs) = directories::ProjectDirs::from("", "", "bucketpub") {
            let user_config = dirs.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.source.kind, SourceKind::Filesystem);
        assert_eq!(config.bus.kind, BusKind::Log);
        assert_eq!(config.metadata.kind, MetadataKind::None);
        assert_eq!(config.parser.array_path, "results.*");
        assert_eq!(config.batch.to_batch_config(), BatchConfig::default());
        assert!(config.workers.default >= 1);
    }

    #[test]
    fn expand_env_var_literal() {
        assert_eq!(expand_env_var("literal"), Some("literal".to_string()));
    }

    #[test]
    fn expand_env_var_missing() {
        assert_eq!(expand_env_var("${BUCKETPUB_NONEXISTENT_12345}"), None);
    }

    #[test]
    fn expand_env_var_set() {
        // PATH is set in every test environment
        let path = std::env::var("PATH").unwrap();
        assert_eq!(expand_env_var("${PATH}"), Some(path));
    }

    #[test]
    fn parse_config_toml() {
        let toml = r#"
[source]
kind = "gcs"
endpoint = "http://localhost:4443"
token = "${BUCKETPUB_NONEXISTENT_12345}"

[metadata]
kind = "static"
values = { dataset = "drug-event" }

[bus]
kind = "ndjson"
path = "/tmp/out.ndjson"

[batch]
max_records = 500
max_latency_ms = 250

[parser]
array_path = "$.data.*"

[workers]
default = 4
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.source.kind, SourceKind::Gcs);
        assert_eq!(config.source.endpoint.as_deref(), Some("http://localhost:4443"));
        assert!(config.source.token.is_none());
        assert_eq!(config.metadata.kind, MetadataKind::Static);
        assert_eq!(config.metadata.values["dataset"], "drug-event");
        assert_eq!(config.bus.kind, BusKind::Ndjson);
        assert_eq!(config.bus.path, PathBuf::from("/tmp/out.ndjson"));

        let batch = config.batch.to_batch_config();
        assert_eq!(batch.max_records, 500);
        assert_eq!(batch.max_latency, Duration::from_millis(250));
        assert_eq!(batch.max_in_flight, 2);
        assert_eq!(config.parser.array_path, "$.data.*");
        assert_eq!(config.workers.default, 4);
    }

    #[test]
    fn unknown_kind_rejected() {
        assert!(toml::from_str::<Config>("[bus]\nkind = \"kafka\"\n").is_err());
    }

    #[test]
    fn from_file_reads_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucketpub.toml");
        std::fs::write(&path, "[http]\nmax_retries = 7\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.http.max_retries, 7);
        assert_eq!(config.http.read_timeout, 10);
    }
}
