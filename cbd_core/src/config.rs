use std::path::Path;

use serde::Deserialize;

use crate::error::{CbdError, Result};
use crate::format::ByteOrder;

/// Default number of counter blocks kept resident (64 × 4 KB = 256 KB).
pub const DEFAULT_CACHE_SEGMENTS: usize = 64;

/// Construction-time settings for a [`CounterBlockDevice`](crate::CounterBlockDevice).
///
/// Loadable from TOML; every field is optional:
///
/// ```toml
/// physical_blocks = 2054
/// byte_order = "big"
/// cache_segments = 16
/// force_reformat = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Physical blocks to use from the store. `None` uses the whole store.
    pub physical_blocks: Option<u64>,
    /// Counter byte order written by `format`. Ignored by `open`, which
    /// always takes the byte order from the header.
    pub byte_order: ByteOrder,
    /// Upper bound on resident counter blocks.
    pub cache_segments: usize,
    /// Allow `format` to overwrite an existing header.
    pub force_reformat: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            physical_blocks: None,
            byte_order: ByteOrder::native(),
            cache_segments: DEFAULT_CACHE_SEGMENTS,
            force_reformat: false,
        }
    }
}

impl DeviceConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| CbdError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CbdError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_segments == 0 {
            return Err(CbdError::Config(
                "cache_segments must be at least 1".to_owned(),
            ));
        }
        Ok(())
    }
}
