//! Runtime configuration
//!
//! Both structs are pure performance knobs: no setting here changes a
//! computed score. They can be built in code, from CLI flags, or loaded from
//! a JSON file.

use crate::{ALICELMError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default prefetch depth (lookups in flight per pipeline)
pub const DEFAULT_PREFETCH_DEPTH: usize = 1;

/// Default per-sentence word buffer capacity
pub const DEFAULT_MAX_SENTENCE_WORDS: usize = 4096;

/// Largest accepted prefetch depth
pub const MAX_PREFETCH_DEPTH: usize = 1024;

/// Largest accepted worker thread count
pub const MAX_THREADS: usize = 1024;

/// Largest accepted per-sentence word buffer capacity
pub const MAX_SENTENCE_WORDS: usize = 1 << 20;

/// Default table oversizing factor
pub const DEFAULT_TABLE_MULTIPLIER: f32 = 1.5;

/// How a probe table reduces a hashed key to its home bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BucketMode {
    /// `key mod buckets` through a precomputed reciprocal
    #[default]
    Divide,
    /// `key & (buckets - 1)`, bucket count rounded up to a power of two
    Mask,
}

impl BucketMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Divide => "divide",
            Self::Mask => "mask",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "divide" | "div" => Ok(Self::Divide),
            "mask" | "power2" => Ok(Self::Mask),
            _ => Err(ALICELMError::InvalidConfig(format!(
                "Unknown bucket mode: {}. Use divide or mask",
                s
            ))),
        }
    }
}

/// Probe table sizing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Buckets per entry (inverse load factor), at least 1.0
    pub multiplier: f32,
    pub bucket_mode: BucketMode,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            multiplier: DEFAULT_TABLE_MULTIPLIER,
            bucket_mode: BucketMode::Divide,
        }
    }
}

impl TableConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ALICELMError::InvalidConfig(format!(
                "Table multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        Ok(())
    }
}

/// Pipeline and driver settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Lookups kept in flight per worker (D)
    pub prefetch_depth: usize,
    /// Worker threads, each with its own pipeline
    pub threads: usize,
    /// Fixed word buffer capacity of one pipeline slot
    pub max_sentence_words: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            prefetch_depth: DEFAULT_PREFETCH_DEPTH,
            threads: 1,
            max_sentence_words: DEFAULT_MAX_SENTENCE_WORDS,
        }
    }
}

impl PipelineConfig {
    pub fn with_depth(mut self, prefetch_depth: usize) -> Self {
        self.prefetch_depth = prefetch_depth;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Every field must lie in `1..=MAX_*`.
    pub fn validate(&self) -> Result<()> {
        check_range("prefetch_depth", self.prefetch_depth, MAX_PREFETCH_DEPTH)?;
        check_range("threads", self.threads, MAX_THREADS)?;
        check_range("max_sentence_words", self.max_sentence_words, MAX_SENTENCE_WORDS)
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }
}

fn check_range(name: &str, value: usize, max: usize) -> Result<()> {
    if value == 0 || value > max {
        return Err(ALICELMError::InvalidConfig(format!(
            "{} must be in 1..={}, got {}",
            name, max, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.prefetch_depth, 1);
        assert_eq!(config.threads, 1);
        assert_eq!(config.max_sentence_words, 4096);
        assert!(config.validate().is_ok());
        assert!(TableConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_depth_rejected() {
        let config = PipelineConfig::default().with_depth(0);
        assert!(matches!(config.validate(), Err(ALICELMError::InvalidConfig(_))));
        let config = PipelineConfig::default().with_threads(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_values_rejected() {
        let config = PipelineConfig::default().with_depth(MAX_PREFETCH_DEPTH);
        assert!(config.validate().is_ok());
        let config = PipelineConfig::default().with_depth(MAX_PREFETCH_DEPTH + 1);
        assert!(matches!(config.validate(), Err(ALICELMError::InvalidConfig(_))));
        let config = PipelineConfig::default().with_threads(usize::MAX);
        assert!(config.validate().is_err());

        let config: PipelineConfig =
            serde_json::from_str(r#"{"max_sentence_words": 18446744073709551615}"#).unwrap();
        assert!(matches!(config.validate(), Err(ALICELMError::InvalidConfig(_))));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.json");
        std::fs::write(&path, r#"{"max_sentence_words": 18446744073709551615}"#).unwrap();
        assert!(matches!(
            PipelineConfig::from_json_file(&path),
            Err(ALICELMError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_multiplier_rejected() {
        let config = TableConfig {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json() {
        let config: PipelineConfig = serde_json::from_str(r#"{"prefetch_depth": 4}"#).unwrap();
        assert_eq!(config.prefetch_depth, 4);
        assert_eq!(config.threads, 1);

        let table: TableConfig = serde_json::from_str(r#"{"bucket_mode": "mask"}"#).unwrap();
        assert_eq!(table.bucket_mode, BucketMode::Mask);
        assert_eq!(table.multiplier, DEFAULT_TABLE_MULTIPLIER);
    }

    #[test]
    fn test_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"prefetch_depth": 3, "threads": 2}"#).unwrap();
        let config = PipelineConfig::from_json_file(&path).unwrap();
        assert_eq!(config.prefetch_depth, 3);
        assert_eq!(config.threads, 2);

        std::fs::write(&path, r#"{"threads": 0}"#).unwrap();
        assert!(PipelineConfig::from_json_file(&path).is_err());
    }

    #[test]
    fn test_bucket_mode_parse() {
        assert_eq!(BucketMode::parse("MASK").unwrap(), BucketMode::Mask);
        assert_eq!(BucketMode::parse("divide").unwrap(), BucketMode::Divide);
        assert!(BucketMode::parse("modulo").is_err());
    }
}
