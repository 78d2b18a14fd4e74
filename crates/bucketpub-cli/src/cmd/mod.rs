pub mod inspect;
pub mod run;

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use bucketpub_core::{
    BusClient, FilesystemSource, LogBus, MetadataProvider, NdjsonBus, SourceProvider,
    StaticMetadata,
};
use bucketpub_remote::{CloudStorage, CloudStorageMetadata, CloudStorageSource, HttpBus, HttpSource};

use crate::config::{BusConfig, BusKind, Config, MetadataKind, SourceKind};

/// Print a key-value summary table on stderr
pub fn print_summary(title: &str, rows: &[(&str, String)]) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new(title).fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);
    for (label, value) in rows {
        table.add_row(vec![Cell::new(label), Cell::new(value)]);
    }
    eprintln!("\n{table}");
}

pub fn build_source(config: &Config) -> Result<Arc<dyn SourceProvider>> {
    let source = &config.source;
    let provider: Arc<dyn SourceProvider> = match source.kind {
        SourceKind::Filesystem => Arc::new(FilesystemSource::new(&source.root)),
        SourceKind::Gcs => {
            let storage = CloudStorage::new(source.endpoint.as_deref(), source.token.clone())?;
            Arc::new(CloudStorageSource::new(storage))
        }
        SourceKind::Http => Arc::new(HttpSource::new(
            source.base_url.as_deref(),
            source.token.clone(),
        )?),
    };
    Ok(provider)
}

/// `None` when provenance carries event attributes only.
pub fn build_metadata(config: &Config) -> Result<Option<Arc<dyn MetadataProvider>>> {
    let metadata = &config.metadata;
    let provider: Arc<dyn MetadataProvider> = match metadata.kind {
        MetadataKind::None => return Ok(None),
        MetadataKind::Static => Arc::new(StaticMetadata(metadata.values.clone())),
        MetadataKind::Gcs => {
            // Reuse the source endpoint and credentials unless overridden
            let endpoint = metadata.endpoint.as_deref().or(config.source.endpoint.as_deref());
            let token = metadata.token.clone().or_else(|| config.source.token.clone());
            let storage = CloudStorage::new(endpoint, token)?;
            Arc::new(CloudStorageMetadata::new(storage))
        }
    };
    Ok(Some(provider))
}

pub fn build_bus(bus: &BusConfig) -> Result<Arc<dyn BusClient>> {
    let client: Arc<dyn BusClient> = match bus.kind {
        BusKind::Log => Arc::new(LogBus::new()),
        BusKind::Ndjson => Arc::new(
            NdjsonBus::open(&bus.path)
                .with_context(|| format!("failed to open {}", bus.path.display()))?,
        ),
        BusKind::Http => {
            let Some(url) = &bus.url else {
                bail!("bus kind \"http\" needs bus.url");
            };
            Arc::new(HttpBus::new(url, bus.token.clone())?)
        }
    };
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_collaborators() {
        let config = Config::default();
        assert!(build_source(&config).unwrap().describe().starts_with("file://"));
        assert!(build_metadata(&config).unwrap().is_none());
        assert!(build_bus(&config.bus).is_ok());
    }

    #[test]
    fn static_metadata_values() {
        let mut config = Config::default();
        config.metadata.kind = MetadataKind::Static;
        config.metadata.values.insert("dataset".into(), "drug-event".into());
        let provider = build_metadata(&config).unwrap().unwrap();
        assert_eq!(provider.get("b", "o").unwrap()["dataset"], "drug-event");
    }

    #[test]
    fn http_bus_requires_url() {
        let bus = BusConfig {
            kind: BusKind::Http,
            ..BusConfig::default()
        };
        let err = build_bus(&bus).err().unwrap();
        assert!(err.to_string().contains("bus.url"));
    }

    #[test]
    fn ndjson_bus_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let bus = BusConfig {
            kind: BusKind::Ndjson,
            path: dir.path().join("out/messages.ndjson"),
            ..BusConfig::default()
        };
        build_bus(&bus).unwrap();
        assert!(dir.path().join("out/messages.ndjson").exists());
    }

    #[test]
    fn invalid_endpoint_rejected() {
        let mut config = Config::default();
        config.source.kind = SourceKind::Gcs;
        config.source.endpoint = Some("not a url".into());
        assert!(build_source(&config).is_err());
    }
}
