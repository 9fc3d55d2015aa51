//! Configuration for the fs layer (from `otter_fs.toml`).

use crate::error::{FsError, FsResult};
use crate::stats::ByteOrder;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsConfig {
    /// Largest single read issued by read streams and size-less read_file
    /// (default: 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub stream_chunk_size: usize,

    /// Byte order of engine stat buffers. Defaults to the platform's.
    #[serde(default)]
    pub byte_order: Option<ByteOrder>,

    /// Mode for files created by `open`/`write_file` (default: 0o666).
    #[serde(default = "default_file_mode")]
    pub default_file_mode: u32,

    /// Mode for directories created by `mkdir` (default: 0o777).
    #[serde(default = "default_dir_mode")]
    pub default_dir_mode: u32,

    /// Request slots allocated up front.
    #[serde(default)]
    pub initial_slots: usize,
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_file_mode() -> u32 {
    0o666
}

fn default_dir_mode() -> u32 {
    0o777
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            stream_chunk_size: default_chunk_size(),
            byte_order: None,
            default_file_mode: default_file_mode(),
            default_dir_mode: default_dir_mode(),
            initial_slots: 0,
        }
    }
}

impl FsConfig {
    pub fn from_toml_str(contents: &str) -> FsResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| FsError::invalid_value(format!("invalid fs config: {e}")))?;
        if config.stream_chunk_size == 0 {
            return Err(FsError::invalid_value(
                "invalid fs config: stream_chunk_size must be positive",
            ));
        }
        Ok(config)
    }

    /// Load from a TOML file, or return defaults.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let default_path = Path::new("otter_fs.toml");
        let config_path = path.unwrap_or(default_path);

        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(contents) => match Self::from_toml_str(&contents) {
                    Ok(cfg) => return cfg,
                    Err(e) => {
                        tracing::warn!(path = %config_path.display(), error = %e, "failed to parse fs config");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %config_path.display(), error = %e, "failed to read fs config");
                }
            }
        }

        Self::default()
    }

    /// Byte order to decode stat buffers with, resolved once.
    pub fn resolved_byte_order(&self) -> ByteOrder {
        self.byte_order.unwrap_or_else(ByteOrder::native)
    }
}
