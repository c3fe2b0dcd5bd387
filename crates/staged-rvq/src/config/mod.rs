//! Quantizer configuration.
//!
//! `QuantizerConfig` fixes the per-item shape and codebook size of a
//! [`StagedResidualQuantizer`](crate::StagedResidualQuantizer), along with the
//! number of stages created up front and the default chunk size used by
//! `reconstruct_default`.
//!
//! # Loading Configuration
//!
//! ```rust,ignore
//! use staged_rvq::QuantizerConfig;
//!
//! let config = QuantizerConfig::from_file("quantizer.toml")?.with_env_overrides();
//! config.validate()?;
//! ```
//!
//! # TOML Structure
//!
//! ```toml
//! shape = [8, 4]
//! options = 16
//! num_stages = 4
//! reconstruct_batch_size = 256
//! ```
//!
//! # Design Principles
//!
//! - **NO FALLBACKS**: Invalid config returns error, never silently defaults
//! - **FAIL FAST**: File not found or parse error returns immediately


use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{QuantizerError, QuantizerResult};

// ============================================================================
// DEFAULT FUNCTIONS
// ============================================================================

fn default_shape() -> Vec<usize> {
    vec![16]
}

fn default_options() -> usize {
    16
}

fn default_num_stages() -> usize {
    0
}

// ============================================================================
// QUANTIZER CONFIG
// ============================================================================

/// Configuration for a staged residual quantizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizerConfig {
    /// Per-item tensor shape, excluding the batch dimension.
    /// Every dimension must be > 0.
    /// Default: [16]
    #[serde(default = "default_shape")]
    pub shape: Vec<usize>,

    /// Codebook size: candidates produced by each stage.
    /// Default: 16
    #[serde(default = "default_options")]
    pub options: usize,

    /// Stages created by `StagedResidualQuantizer::from_config`.
    /// Zero is valid and yields empty code sequences.
    /// Default: 0
    #[serde(default = "default_num_stages")]
    pub num_stages: usize,

    /// Chunk size used by `reconstruct_default` to bound peak memory.
    /// `None` encodes the whole batch at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconstruct_batch_size: Option<usize>,
}

impl Default for QuantizerConfig {
    fn default() -> Self {
        Self {
            shape: default_shape(),
            options: default_options(),
            num_stages: default_num_stages(),
            reconstruct_batch_size: None,
        }
    }
}

impl QuantizerConfig {
    /// Create a configuration for the given shape and codebook size.
    pub fn new(shape: impl Into<Vec<usize>>, options: usize) -> Self {
        Self {
            shape: shape.into(),
            options,
            ..Default::default()
        }
    }

    /// Set the number of stages built by `from_config`.
    #[must_use]
    pub fn with_num_stages(mut self, num_stages: usize) -> Self {
        self.num_stages = num_stages;
        self
    }

    /// Set the default chunk size for `reconstruct_default`.
    #[must_use]
    pub fn with_reconstruct_batch_size(mut self, batch_size: usize) -> Self {
        self.reconstruct_batch_size = Some(batch_size);
        self
    }

    /// Number of scalar elements in one item.
    #[must_use]
    pub fn item_len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// - `QuantizerError::ConfigError` if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> QuantizerResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| QuantizerError::ConfigError {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        toml::from_str(&contents).map_err(|e| QuantizerError::ConfigError {
            message: format!("Failed to parse TOML in '{}': {}", path.display(), e),
        })
    }

    /// Create configuration from a TOML string.
    ///
    /// # Errors
    /// - `QuantizerError::ConfigError` if TOML parsing fails
    pub fn from_toml_str(toml: &str) -> QuantizerResult<Self> {
        toml::from_str(toml).map_err(|e| QuantizerError::ConfigError {
            message: format!("Failed to parse TOML: {}", e),
        })
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    /// - `QuantizerError::ConfigError` if serialization fails
    pub fn to_toml_string(&self) -> QuantizerResult<String> {
        toml::to_string_pretty(self).map_err(|e| QuantizerError::ConfigError {
            message: format!("Failed to serialize to TOML: {}", e),
        })
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `QuantizerError::ConfigError` if:
    /// - shape is empty or any dimension is 0
    /// - options == 0
    /// - options exceeds the `u32` code range
    /// - reconstruct_batch_size == Some(0)
    pub fn validate(&self) -> QuantizerResult<()> {
        if self.shape.is_empty() {
            return Err(QuantizerError::ConfigError {
                message: "shape must have at least one dimension".to_string(),
            });
        }
        if let Some(axis) = self.shape.iter().position(|&d| d == 0) {
            return Err(QuantizerError::ConfigError {
                message: format!("shape dimension {} must be > 0, got {:?}", axis, self.shape),
            });
        }
        if self.options == 0 {
            return Err(QuantizerError::ConfigError {
                message: "options must be > 0".to_string(),
            });
        }
        if self.options > u32::MAX as usize {
            return Err(QuantizerError::ConfigError {
                message: format!("options must fit in u32, got {}", self.options),
            });
        }
        if self.reconstruct_batch_size == Some(0) {
            return Err(QuantizerError::ConfigError {
                message: "reconstruct_batch_size must be > 0 when set".to_string(),
            });
        }
        Ok(())
    }

    /// Apply environment variable overrides. Prefix: `RVQ_`
    ///
    /// | Variable | Field | Format |
    /// |----------|-------|--------|
    /// | `RVQ_SHAPE` | `shape` | comma separated, e.g. `8,4` |
    /// | `RVQ_OPTIONS` | `options` | usize |
    /// | `RVQ_NUM_STAGES` | `num_stages` | usize |
    /// | `RVQ_RECONSTRUCT_BATCH_SIZE` | `reconstruct_batch_size` | usize, or `none` |
    ///
    /// Unparseable values are ignored and the existing value is kept.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = env::var("RVQ_SHAPE") {
            let parsed: Result<Vec<usize>, _> =
                val.split(',').map(|s| s.trim().parse::<usize>()).collect();
            if let Ok(shape) = parsed {
                self.shape = shape;
            }
        }
        if let Ok(val) = env::var("RVQ_OPTIONS") {
            if let Ok(n) = val.parse::<usize>() {
                self.options = n;
            }
        }
        if let Ok(val) = env::var("RVQ_NUM_STAGES") {
            if let Ok(n) = val.parse::<usize>() {
                self.num_stages = n;
            }
        }
        if let Ok(val) = env::var("RVQ_RECONSTRUCT_BATCH_SIZE") {
            if val.eq_ignore_ascii_case("none") {
                self.reconstruct_batch_size = None;
            } else if let Ok(n) = val.parse::<usize>() {
                self.reconstruct_batch_size = Some(n);
            }
        }
        self
    }
}
