use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tarn_fabric::SignalBackend;
use tarn_store::StoreConfig;

/// Settings read from `--config`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub store: StoreConfig,
    pub signal: SignalBackend,
}

impl CliConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_store::{Compression, Durability};

    #[test]
    fn missing_path_gives_defaults() {
        assert_eq!(CliConfig::load(None).unwrap(), CliConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tarn.toml");
        std::fs::write(
            &path,
            r#"
[store]
durability = "unsafe"
compression = "none"

[signal]
kind = "poll"
interval_ms = 250
"#,
        )
        .unwrap();
        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.store.durability, Durability::Unsafe);
        assert_eq!(config.store.compression, Compression::None);
        assert_eq!(
            config.store.page_cache_capacity,
            StoreConfig::default().page_cache_capacity
        );
        assert_eq!(config.signal, SignalBackend::Poll { interval_ms: 250 });
    }

    #[test]
    fn unreadable_file_names_the_path() {
        let err = CliConfig::load(Some(Path::new("/nonexistent/tarn.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tarn.toml"));
    }
}
