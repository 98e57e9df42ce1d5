//! Model facade, builder and image persistence
//!
//! A [`Model`] pairs a vocabulary with a read-only [`Search`] backend and the
//! two canonical starting states. It is `Sync` and shared by reference
//! across every pipeline and worker thread.
//!
//! ## Image layout
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ Magic: "ALICELMB" (8 bytes)             │
//! ├─────────────────────────────────────────┤
//! │ Version: 1.0 (2 bytes)                  │
//! ├─────────────────────────────────────────┤
//! │ Vocabulary + tables (bincode)           │
//! └─────────────────────────────────────────┘
//! ```

use crate::config::TableConfig;
use crate::lookup::Lookup;
use crate::probe_table::ProbeTable;
use crate::search::{hash_ngram, HashedSearch, LongestEntry, MiddleEntry, Search};
use crate::weights::{ScoreResult, State, Weights, EXTENSION_BACKOFF, NO_EXTENSION_BACKOFF, UNKNOWN_PROB};
use crate::word_stream::WordWidth;
use crate::{ALICELMError, Result, WordIndex, MAX_ORDER};
use log::{debug, info};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;

/// Model image magic bytes
pub const MODEL_MAGIC: &[u8; 8] = b"ALICELMB";

/// Model image version
pub const MODEL_VERSION: (u8, u8) = (1, 0);

const HEADER_SIZE: usize = 10;

/// Vocabulary bound and reserved ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    bound: WordIndex,
    unknown: WordIndex,
    begin_sentence: WordIndex,
    end_sentence: WordIndex,
}

impl Vocabulary {
    /// `<unk>` = 0, `<s>` = 1, `</s>` = 2
    pub fn new(bound: WordIndex) -> Self {
        Self::with_specials(bound, 0, 1, 2)
    }

    pub fn with_specials(
        bound: WordIndex,
        unknown: WordIndex,
        begin_sentence: WordIndex,
        end_sentence: WordIndex,
    ) -> Self {
        Self {
            bound,
            unknown,
            begin_sentence,
            end_sentence,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, id) in [
            ("<unk>", self.unknown),
            ("<s>", self.begin_sentence),
            ("</s>", self.end_sentence),
        ] {
            if id >= self.bound {
                return Err(ALICELMError::ModelError(format!(
                    "{} id {} outside vocabulary bound {}",
                    name, id, self.bound
                )));
            }
        }
        if self.begin_sentence == self.end_sentence {
            return Err(ALICELMError::ModelError(
                "<s> and </s> must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Exclusive upper bound of word ids
    #[inline]
    pub fn bound(&self) -> WordIndex {
        self.bound
    }

    #[inline]
    pub fn unknown(&self) -> WordIndex {
        self.unknown
    }

    #[inline]
    pub fn begin_sentence(&self) -> WordIndex {
        self.begin_sentence
    }

    #[inline]
    pub fn end_sentence(&self) -> WordIndex {
        self.end_sentence
    }

    /// `MalformedInput` unless `word` is below the bound
    #[inline]
    pub fn check(&self, word: WordIndex) -> Result<()> {
        if word >= self.bound {
            return Err(ALICELMError::MalformedInput(format!(
                "word id {} outside vocabulary bound {}",
                word, self.bound
            )));
        }
        Ok(())
    }

    /// Narrowest stream width holding every id
    pub fn width(&self) -> WordWidth {
        WordWidth::for_bound(self.bound as u64)
    }
}

/// Read-only n-gram model over a backend
#[derive(Debug, Clone)]
pub struct Model<S: Search> {
    vocab: Vocabulary,
    search: S,
    begin_sentence: State,
    null_context: State,
}

/// Model over probe tables
pub type HashedModel = Model<HashedSearch>;

impl<S: Search> Model<S> {
    pub fn from_parts(vocab: Vocabulary, search: S) -> Result<Self> {
        vocab.validate()?;
        if vocab.bound() != search.vocab_bound() {
            return Err(ALICELMError::ModelError(format!(
                "Vocabulary bound {} does not match unigram table size {}",
                vocab.bound(),
                search.vocab_bound()
            )));
        }

        let mut begin_sentence = State::default();
        if search.order() > 1 {
            let mut node = S::Node::default();
            let uni = search.lookup_unigram(vocab.begin_sentence(), &mut node);
            begin_sentence.words[0] = vocab.begin_sentence();
            begin_sentence.backoff[0] = uni.backoff;
            begin_sentence.length = 1;
        }

        Ok(Self {
            vocab,
            search,
            begin_sentence,
            null_context: State::default(),
        })
    }

    #[inline]
    pub fn order(&self) -> u8 {
        self.search.order()
    }

    #[inline]
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    #[inline]
    pub fn search(&self) -> &S {
        &self.search
    }

    /// State after `<s>`
    #[inline]
    pub fn begin_sentence_state(&self) -> State {
        self.begin_sentence
    }

    /// State with no context
    #[inline]
    pub fn null_context_state(&self) -> State {
        self.null_context
    }

    /// A fresh lookup bound to this model
    pub fn lookup(&self) -> Lookup<'_, S> {
        Lookup::new(&self.search)
    }

    /// Score `word` after `in_state`, backoff included. Non-pipelined.
    ///
    /// # Panics
    ///
    /// If `word` is at or above the vocabulary bound. Use
    /// [`Model::try_full_score`] for unchecked input.
    pub fn full_score(&self, in_state: &State, word: WordIndex) -> (ScoreResult, State) {
        let mut lookup = self.lookup();
        let (mut ret, out_state) = lookup.run_to_end(in_state.context(), word);
        ret.prob += in_state.backoff_from(ret.ngram_length);
        (ret, out_state)
    }

    /// [`Model::full_score`] with the word id checked against the bound.
    pub fn try_full_score(&self, in_state: &State, word: WordIndex) -> Result<(ScoreResult, State)> {
        self.vocab.check(word)?;
        Ok(self.full_score(in_state, word))
    }

    /// Sum of full scores over `words`, starting from `<s>`.
    ///
    /// # Panics
    ///
    /// If any word is at or above the vocabulary bound.
    pub fn score_sentence(&self, words: &[WordIndex]) -> f32 {
        let mut state = self.begin_sentence;
        let mut sum = 0.0f32;
        for &word in words {
            let (ret, next) = self.full_score(&state, word);
            sum += ret.prob;
            state = next;
        }
        sum
    }
}

/// Size report for one order
#[derive(Debug, Clone)]
pub struct TableStats {
    pub order: u8,
    pub entries: usize,
    pub buckets: usize,
    pub load_factor: f64,
    pub memory_bytes: usize,
}

#[derive(Serialize)]
struct ImageRef<'a> {
    vocab: &'a Vocabulary,
    search: &'a HashedSearch,
}

#[derive(Deserialize)]
struct Image {
    vocab: Vocabulary,
    search: HashedSearch,
}

impl Model<HashedSearch> {
    /// Per-order table statistics, unigrams first
    pub fn table_stats(&self) -> Vec<TableStats> {
        let mut stats = vec![TableStats {
            order: 1,
            entries: self.search.unigrams().len(),
            buckets: self.search.unigrams().len(),
            load_factor: 1.0,
            memory_bytes: std::mem::size_of_val(self.search.unigrams()),
        }];
        for (i, t) in self.search.middle_tables().iter().enumerate() {
            stats.push(TableStats {
                order: i as u8 + 2,
                entries: t.len(),
                buckets: t.buckets(),
                load_factor: t.load_factor(),
                memory_bytes: t.memory_bytes(),
            });
        }
        if self.order() > 1 {
            let t = self.search.longest_table();
            stats.push(TableStats {
                order: self.order(),
                entries: t.len(),
                buckets: t.buckets(),
                load_factor: t.load_factor(),
                memory_bytes: t.memory_bytes(),
            });
        }
        stats
    }

    /// Serialize to an image
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(&ImageRef {
            vocab: &self.vocab,
            search: &self.search,
        })
        .map_err(|e| ALICELMError::Serialization(e.to_string()))?;
        let mut output = Vec::with_capacity(HEADER_SIZE + payload.len());
        output.extend_from_slice(MODEL_MAGIC);
        output.push(MODEL_VERSION.0);
        output.push(MODEL_VERSION.1);
        output.extend_from_slice(&payload);
        Ok(output)
    }

    /// Parse an image
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ALICELMError::ModelError(
                "Model image too short".to_string(),
            ));
        }
        if &data[0..8] != MODEL_MAGIC {
            return Err(ALICELMError::InvalidMagic);
        }
        if (data[8], data[9]) != MODEL_VERSION {
            return Err(ALICELMError::InvalidVersion(data[8], data[9]));
        }
        let image: Image = bincode::deserialize(&data[HEADER_SIZE..])
            .map_err(|e| ALICELMError::Serialization(e.to_string()))?;
        image.search.validate()?;
        Self::from_parts(image.vocab, image.search)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), &bytes)?;
        info!(
            "Saved order-{} model to {} ({} bytes)",
            self.order(),
            path.as_ref().display(),
            bytes.len()
        );
        Ok(())
    }

    /// Load an image through a read-only memory map
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the map is read-only and dropped before returning; the
        // tables are copied out by deserialization.
        let mmap = unsafe { Mmap::map(&file)? };
        let model = Self::from_bytes(&mmap[..])?;
        info!(
            "Loaded order-{} model from {}: counts {:?}",
            model.order(),
            path.as_ref().display(),
            model.search.counts()
        );
        Ok(model)
    }
}

type NGramKey = SmallVec<[WordIndex; MAX_ORDER]>;

#[derive(Debug, Clone, Copy)]
struct RawWeights {
    prob: f32,
    backoff: f32,
    rest: f32,
}

/// Build-time collector for a [`HashedModel`]
///
/// N-grams are given oldest word first. Every n-gram of order >= 3 needs its
/// suffix (the n-gram without its oldest word) to be present as well; the
/// lookup walks suffixes and cannot reach a longer n-gram past a gap.
pub struct ModelBuilder {
    order: u8,
    vocab: Vocabulary,
    unigrams: HashMap<WordIndex, RawWeights>,
    /// Index `k` holds n-grams of length `k + 2`
    ngrams: Vec<HashMap<NGramKey, RawWeights>>,
    rejected: Option<String>,
}

impl ModelBuilder {
    pub fn new(order: u8, vocab: Vocabulary) -> Self {
        Self {
            order,
            vocab,
            unigrams: HashMap::new(),
            ngrams: vec![HashMap::new(); MAX_ORDER - 1],
            rejected: None,
        }
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn unigram(&mut self, word: WordIndex, prob: f32, backoff: f32) -> &mut Self {
        self.unigram_with_rest(word, prob, backoff, prob)
    }

    pub fn unigram_with_rest(&mut self, word: WordIndex, prob: f32, backoff: f32, rest: f32) -> &mut Self {
        self.unigrams.insert(word, RawWeights { prob, backoff, rest });
        self
    }

    /// Add an n-gram of length >= 2 (length 1 is routed to `unigram`).
    pub fn ngram(&mut self, words: &[WordIndex], prob: f32, backoff: f32) -> &mut Self {
        self.ngram_with_rest(words, prob, backoff, prob)
    }

    pub fn ngram_with_rest(&mut self, words: &[WordIndex], prob: f32, backoff: f32, rest: f32) -> &mut Self {
        match words.len() {
            1 => return self.unigram_with_rest(words[0], prob, backoff, rest),
            2..=MAX_ORDER => {
                self.ngrams[words.len() - 2]
                    .insert(NGramKey::from_slice(words), RawWeights { prob, backoff, rest });
            }
            n => {
                if self.rejected.is_none() {
                    self.rejected = Some(format!("N-gram length {} outside 1..={}", n, MAX_ORDER));
                }
            }
        }
        self
    }

    pub fn contains(&self, words: &[WordIndex]) -> bool {
        match words.len() {
            1 => self.unigrams.contains_key(&words[0]),
            2..=MAX_ORDER => self.ngrams[words.len() - 2].contains_key(words),
            _ => false,
        }
    }

    /// Validate, derive flags and fill the probe tables.
    pub fn build(&self, config: &TableConfig) -> Result<HashedModel> {
        config.validate()?;
        self.vocab.validate()?;
        if self.order == 0 || self.order as usize > MAX_ORDER {
            return Err(ALICELMError::ModelError(format!(
                "Order {} outside 1..={}",
                self.order, MAX_ORDER
            )));
        }
        if let Some(reason) = &self.rejected {
            return Err(ALICELMError::ModelError(reason.clone()));
        }
        let order = self.order as usize;
        let bound = self.vocab.bound();

        for (k, map) in self.ngrams.iter().enumerate() {
            let len = k + 2;
            if len > order && !map.is_empty() {
                return Err(ALICELMError::ModelError(format!(
                    "{} n-grams of length {} exceed order {}",
                    map.len(),
                    len,
                    order
                )));
            }
        }
        if let Some(&w) = self.unigrams.keys().find(|&&w| w >= bound) {
            return Err(ALICELMError::ModelError(format!(
                "Unigram id {} outside vocabulary bound {}",
                w, bound
            )));
        }

        // Flags: left extensions are recorded on suffixes, right contexts on prefixes.
        let mut left_extended: Vec<HashSet<NGramKey>> = vec![HashSet::new(); order];
        let mut is_context: Vec<HashSet<NGramKey>> = vec![HashSet::new(); order];
        for len in 2..=order {
            for words in self.ngrams[len - 2].keys() {
                if let Some(&w) = words.iter().find(|&&w| w >= bound) {
                    return Err(ALICELMError::ModelError(format!(
                        "Word id {} in n-gram {:?} outside vocabulary bound {}",
                        w, words, bound
                    )));
                }
                let suffix = &words[1..];
                if len >= 3 && !self.ngrams[len - 3].contains_key(suffix) {
                    return Err(ALICELMError::ModelError(format!(
                        "N-gram {:?} is missing its suffix {:?}",
                        words, suffix
                    )));
                }
                left_extended[len - 2].insert(NGramKey::from_slice(suffix));
                is_context[len - 2].insert(NGramKey::from_slice(&words[..len - 1]));
            }
        }

        let fallback = self
            .unigrams
            .get(&self.vocab.unknown())
            .copied()
            .unwrap_or(RawWeights {
                prob: UNKNOWN_PROB,
                backoff: 0.0,
                rest: UNKNOWN_PROB,
            });
        let unigrams: Vec<Weights> = (0..bound)
            .map(|w| {
                let raw = self.unigrams.get(&w).copied().unwrap_or(fallback);
                let key = NGramKey::from_slice(&[w]);
                let context = order > 1 && is_context[0].contains(&key);
                let independent = order == 1 || !left_extended[0].contains(&key);
                Weights::new(raw.prob, mark_backoff(raw.backoff, context), raw.rest, independent)
            })
            .collect();

        let mut middle = Vec::with_capacity(order.saturating_sub(2));
        for len in 2..order {
            let map = &self.ngrams[len - 2];
            let mut table = ProbeTable::new(map.len(), config)?;
            for (words, raw) in map {
                let context = is_context[len - 1].contains(words);
                let independent = !left_extended[len - 1].contains(words);
                table.insert(MiddleEntry::new(
                    hash_ngram(words),
                    Weights::new(raw.prob, mark_backoff(raw.backoff, context), raw.rest, independent),
                ))?;
            }
            debug!(
                "Order {}: {} entries in {} buckets",
                len,
                table.len(),
                table.buckets()
            );
            middle.push(table);
        }

        let longest = if order > 1 {
            let map = &self.ngrams[order - 2];
            let mut table = ProbeTable::new(map.len(), config)?;
            for (words, raw) in map {
                table.insert(LongestEntry::new(hash_ngram(words), raw.prob))?;
            }
            table
        } else {
            ProbeTable::new(0, config)?
        };

        let search = HashedSearch::new(self.order, unigrams, middle, longest)?;
        Model::from_parts(self.vocab, search)
    }
}

/// Encode whether a state ending in this n-gram can be extended rightwards.
fn mark_backoff(backoff: f32, is_context: bool) -> f32 {
    if backoff != 0.0 {
        backoff
    } else if is_context {
        EXTENSION_BACKOFF
    } else {
        NO_EXTENSION_BACKOFF
    }
}
