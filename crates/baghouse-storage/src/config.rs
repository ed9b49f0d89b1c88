//! Writer Configuration
//!
//! Controls how the engine cuts chunks while recording:
//!
//! - **compression**: codec applied to each chunk body (default: none)
//! - **chunk_threshold**: a chunk closes once its uncompressed size exceeds
//!   this many bytes (default: 768KB)

use baghouse_core::CompressionType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BagConfig {
    /// Chunk compression codec (default: none)
    #[serde(default)]
    pub compression: CompressionType,

    /// Uncompressed chunk size threshold in bytes (default: 768KB)
    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: u32,
}

impl Default for BagConfig {
    fn default() -> Self {
        Self {
            compression: CompressionType::None,
            chunk_threshold: default_chunk_threshold(),
        }
    }
}

fn default_chunk_threshold() -> u32 {
    768 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BagConfig::default();
        assert_eq!(config.compression, CompressionType::None);
        assert_eq!(config.chunk_threshold, 768 * 1024);
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: BagConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.chunk_threshold, 768 * 1024);
        assert_eq!(config.compression, CompressionType::None);
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = BagConfig {
            compression: CompressionType::Lz4,
            chunk_threshold: 16,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: BagConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.compression, CompressionType::Lz4);
        assert_eq!(back.chunk_threshold, 16);
    }
}
