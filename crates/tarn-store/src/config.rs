use serde::{Deserialize, Serialize};

/// When commits are forced to stable storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// `fsync` at every ordering point of a commit.
    #[default]
    Full,
    /// Never `fsync`. A crash may lose recent commits, but never exposes a
    /// partial one to a running process.
    Unsafe,
}

/// Block compression codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Zstd { level: i32 },
}

impl Default for Compression {
    fn default() -> Self {
        Self::Zstd { level: 3 }
    }
}

/// Tuning knobs for a [`VersionedStore`](crate::VersionedStore).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub durability: Durability,
    pub compression: Compression,
    /// Blocks smaller than this are stored uncompressed.
    pub compression_threshold: usize,
    /// Number of decoded pages kept in memory.
    pub page_cache_capacity: usize,
    /// Transaction logs kept past the point where no reader needs them, so
    /// that history stays inspectable.
    pub retained_history: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            durability: Durability::Full,
            compression: Compression::default(),
            compression_threshold: 4096,
            page_cache_capacity: 1024,
            retained_history: 64,
        }
    }
}

impl StoreConfig {
    /// Config for tests and scratch files: no fsync, no compression.
    pub fn ephemeral() -> Self {
        Self {
            durability: Durability::Unsafe,
            compression: Compression::None,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let config: StoreConfig = serde_json::from_str(r#"{"durability":"unsafe"}"#).unwrap();
        assert_eq!(config.durability, Durability::Unsafe);
        assert_eq!(config.page_cache_capacity, 1024);
        assert_eq!(config.compression, Compression::Zstd { level: 3 });
    }
}
