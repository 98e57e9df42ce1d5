//! # ALICE-LM
//!
//! Pipelined n-gram language model query engine.
//!
//! Hide probe latency, not predictions.
//!
//! Scoring a word walks hash tables one order at a time, and every order is
//! a likely cache miss. ALICE-LM splits each probe into "compute the bucket
//! and prefetch it" and "finish the probe", and keeps D sentences in flight
//! so the memory system works on one while the CPU works on the others.
//!
//! ## Principle
//!
//! ```text
//! Word stream (… w w </s> w w w </s> …)
//!     ↓
//! Driver: split at </s> into one chunk per thread
//!     ↓
//! Pipeline: D sentence slots, round-robin
//!     ↓
//! Lookup: unigram → middle(2) → … → longest(N)
//!     │        locate + prefetch │ complete
//!     ↓
//! Per-sentence log10 probability → aggregate sum
//! ```
//!
//! ## Example
//!
//! ```rust
//! use alice_lm::{Driver, ModelBuilder, PipelineConfig, TableConfig, Vocabulary};
//!
//! // <unk>=0 <s>=1 </s>=2
//! let mut builder = ModelBuilder::new(2, Vocabulary::new(8));
//! builder.unigram(1, -99.0, -0.5).unigram(2, -1.0, 0.0).unigram(3, -1.5, -0.2);
//! builder.ngram(&[1, 3], -0.4, 0.0).ngram(&[3, 2], -0.3, 0.0);
//! let model = builder.build(&TableConfig::default()).unwrap();
//!
//! let config = PipelineConfig::default().with_depth(4);
//! let report = Driver::new(&model, config)
//!     .unwrap()
//!     .run_words(&[3, 2, 3, 3, 2])
//!     .unwrap();
//! assert_eq!(report.sentences, 2);
//! assert_eq!(report.words, 5);
//! ```

// --- Global Allocator: mimalloc (Microsoft's high-performance allocator) ---
#[cfg(not(target_env = "msvc"))]
use mimalloc::MiMalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod config;
pub mod fast_div;
pub mod probe_table;
pub mod weights;

// Backend and per-word lookup
pub mod lookup;
pub mod model;
pub mod search;

// Scheduling
pub mod driver;
pub mod pipeline;
pub mod sentence;
pub mod word_stream;

// Workloads
pub mod synth;
pub mod table_bench;

pub use config::{BucketMode, PipelineConfig, TableConfig};
pub use driver::{partition, Driver, RunReport};
pub use fast_div::Divider;
pub use lookup::{Lookup, Step};
pub use model::{HashedModel, Model, ModelBuilder, TableStats, Vocabulary, MODEL_MAGIC, MODEL_VERSION};
pub use pipeline::{Pipeline, PipelineReport};
pub use probe_table::{BucketCursor, ProbeEntry, ProbeTable, EMPTY_KEY};
pub use search::{combine_word_hash, hash_ngram, HashedSearch, Hit, Search};
pub use sentence::{Feed, Progress, Sentence};
pub use synth::SynthSpec;
pub use table_bench::{TableBenchResult, TableBenchSpec};
pub use weights::{ScoreResult, State, Weights};
pub use word_stream::{decode_words, encode_words, WordReader, WordWidth};

use thiserror::Error;

/// Word id in the model vocabulary
pub type WordIndex = u32;

/// Highest supported model order
pub const MAX_ORDER: usize = 6;

/// Error types for ALICE-LM operations
#[derive(Error, Debug)]
pub enum ALICELMError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic: expected ALICELMB")]
    InvalidMagic,

    #[error("Invalid version: {0}.{1}")]
    InvalidVersion(u8, u8),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Sentence longer than the {limit}-word slot buffer")]
    SentenceTooLong { limit: usize },

    #[error("Probe table full: {buckets} buckets")]
    CapacityExceeded { buckets: usize },

    #[error("Key 0 is reserved for empty buckets")]
    ReservedKey,

    #[error("Duplicate key: {0:#018x}")]
    DuplicateKey(u64),

    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ALICELMError>;
