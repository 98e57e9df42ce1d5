//! Backend contract and the hashed backend
//!
//! The lookup state machine only ever talks to a [`Search`]. Every order
//! above the unigram is split into an address phase and a completion phase
//! so the pipeline can prefetch between them; any backend (hash tables here,
//! a bit-packed trie elsewhere) has to honour that split.
//!
//! ## Hashed layout
//!
//! ```text
//! unigrams : Vec<Weights>                  indexed by word id
//! middle[k]: ProbeTable<MiddleEntry>       order k + 2, 2 <= order < N
//! longest  : ProbeTable<LongestEntry>      order N
//! ```
//!
//! An n-gram `w1 .. wk` (oldest first) is keyed by starting from `wk` and
//! folding in `w(k-1)`, ..., `w1` with [`combine_word_hash`], which is exactly
//! the order in which a lookup walks its context.

use crate::probe_table::{BucketCursor, ProbeEntry, ProbeTable};
use crate::weights::Weights;
use crate::{ALICELMError, Result, WordIndex, MAX_ORDER};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Weights found at one order, flags decoded
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Hit {
    pub prob: f32,
    pub backoff: f32,
    pub rest: f32,
    pub independent_left: bool,
    pub extend_left: u64,
}

/// Capability set queried by [`crate::Lookup`]
///
/// `Node` is the traversal position after the orders matched so far;
/// `MiddleIter` is the phase-one result for one middle order. Both are plain
/// values owned by the lookup that produced them.
pub trait Search: Send + Sync {
    type Node: Copy + Default + std::fmt::Debug;
    type MiddleIter: Copy + Default + std::fmt::Debug;

    /// Highest order N
    fn order(&self) -> u8;

    /// Exclusive upper bound of valid word ids
    fn vocab_bound(&self) -> WordIndex;

    /// Unigram lookup. Total over the vocabulary; initialises `node`.
    ///
    /// Callers guarantee `word < vocab_bound()`; backends may panic otherwise.
    fn lookup_unigram(&self, word: WordIndex, node: &mut Self::Node) -> Hit;

    /// Address phase for order `order_minus_2 + 2`; extends `node` by `word`.
    fn lookup_middle_iterator(
        &self,
        order_minus_2: u8,
        word: WordIndex,
        node: &mut Self::Node,
    ) -> Self::MiddleIter;

    /// Completion phase. `None` means the longer n-gram is absent.
    fn lookup_middle_from_iterator(
        &self,
        order_minus_2: u8,
        node: Self::Node,
        iter: Self::MiddleIter,
    ) -> Option<Hit>;

    /// Order-N lookup. Longest n-grams carry no backoff or rest.
    fn lookup_longest(&self, word: WordIndex, node: Self::Node) -> Option<f32>;

    /// Cache hint for a phase-one result. Backends without one do nothing.
    #[inline(always)]
    fn prefetch_middle(&self, _order_minus_2: u8, _iter: Self::MiddleIter) {}
}

/// Fold one more (older) word into an n-gram hash.
#[inline(always)]
pub fn combine_word_hash(current: u64, next: WordIndex) -> u64 {
    current.wrapping_mul(8978948897894561157)
        ^ (1 + next as u64).wrapping_mul(17894857484156487943)
}

/// Key of an n-gram given oldest first.
pub fn hash_ngram(words: &[WordIndex]) -> u64 {
    match words.split_last() {
        None => 0,
        Some((&newest, older)) => older
            .iter()
            .rev()
            .fold(newest as u64, |h, &w| combine_word_hash(h, w)),
    }
}

/// Probe table record for orders 2..N-1
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct MiddleEntry {
    pub key: u64,
    pub weights: Weights,
    pad: u32,
}

impl MiddleEntry {
    pub fn new(key: u64, weights: Weights) -> Self {
        Self {
            key,
            weights,
            pad: 0,
        }
    }
}

impl ProbeEntry for MiddleEntry {
    #[inline(always)]
    fn key(&self) -> u64 {
        self.key
    }
}

/// Probe table record for order N
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct LongestEntry {
    pub key: u64,
    pub prob: f32,
    pad: u32,
}

impl LongestEntry {
    pub fn new(key: u64, prob: f32) -> Self {
        Self { key, prob, pad: 0 }
    }
}

impl ProbeEntry for LongestEntry {
    #[inline(always)]
    fn key(&self) -> u64 {
        self.key
    }
}

/// Probe-table backend: one table per order above the unigram
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashedSearch {
    order: u8,
    unigrams: Vec<Weights>,
    middle: Vec<ProbeTable<MiddleEntry>>,
    longest: ProbeTable<LongestEntry>,
}

impl HashedSearch {
    /// Assemble from filled tables. `middle` must hold orders 2..N-1.
    pub fn new(
        order: u8,
        unigrams: Vec<Weights>,
        middle: Vec<ProbeTable<MiddleEntry>>,
        longest: ProbeTable<LongestEntry>,
    ) -> Result<Self> {
        let search = Self {
            order,
            unigrams,
            middle,
            longest,
        };
        search.validate()?;
        Ok(search)
    }

    /// Structural checks shared by construction and image loading
    pub fn validate(&self) -> Result<()> {
        if self.order == 0 || self.order as usize > MAX_ORDER {
            return Err(ALICELMError::ModelError(format!(
                "Order {} outside 1..={}",
                self.order, MAX_ORDER
            )));
        }
        let expected = (self.order as usize).saturating_sub(2);
        if self.middle.len() != expected {
            return Err(ALICELMError::ModelError(format!(
                "Order {} needs {} middle tables, found {}",
                self.order,
                expected,
                self.middle.len()
            )));
        }
        if self.unigrams.is_empty() || self.unigrams.len() > WordIndex::MAX as usize {
            return Err(ALICELMError::ModelError(format!(
                "Unigram table size {} out of range",
                self.unigrams.len()
            )));
        }
        Ok(())
    }

    pub fn unigrams(&self) -> &[Weights] {
        &self.unigrams
    }

    pub fn middle_tables(&self) -> &[ProbeTable<MiddleEntry>] {
        &self.middle
    }

    pub fn longest_table(&self) -> &ProbeTable<LongestEntry> {
        &self.longest
    }

    /// Stored n-gram count per order, unigrams first
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![self.unigrams.len()];
        counts.extend(self.middle.iter().map(|t| t.len()));
        if self.order > 1 {
            counts.push(self.longest.len());
        }
        counts
    }
}

impl Search for HashedSearch {
    type Node = u64;
    type MiddleIter = BucketCursor;

    #[inline(always)]
    fn order(&self) -> u8 {
        self.order
    }

    #[inline(always)]
    fn vocab_bound(&self) -> WordIndex {
        self.unigrams.len() as WordIndex
    }

    #[inline]
    fn lookup_unigram(&self, word: WordIndex, node: &mut u64) -> Hit {
        debug_assert!((word as usize) < self.unigrams.len());
        *node = word as u64;
        let w = &self.unigrams[word as usize];
        Hit {
            prob: w.prob(),
            backoff: w.backoff(),
            rest: w.rest(),
            independent_left: w.independent_left(),
            extend_left: word as u64,
        }
    }

    #[inline]
    fn lookup_middle_iterator(&self, order_minus_2: u8, word: WordIndex, node: &mut u64) -> BucketCursor {
        *node = combine_word_hash(*node, word);
        self.middle[order_minus_2 as usize].locate_bucket(*node)
    }

    #[inline]
    fn lookup_middle_from_iterator(&self, order_minus_2: u8, node: u64, iter: BucketCursor) -> Option<Hit> {
        let found = self.middle[order_minus_2 as usize].complete_find(node, iter)?;
        let w = &found.weights;
        Some(Hit {
            prob: w.prob(),
            backoff: w.backoff(),
            rest: w.rest(),
            independent_left: w.independent_left(),
            extend_left: node,
        })
    }

    #[inline]
    fn lookup_longest(&self, word: WordIndex, node: u64) -> Option<f32> {
        self.longest
            .find(combine_word_hash(node, word))
            .map(|e| e.prob)
    }

    #[inline(always)]
    fn prefetch_middle(&self, order_minus_2: u8, iter: BucketCursor) {
        self.middle[order_minus_2 as usize].prefetch(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;

    fn tiny_search() -> HashedSearch {
        // order 3, vocab 0..5; bigram (3 4), trigram (2 3 4)
        let unigrams: Vec<Weights> = (0..5)
            .map(|w| Weights::new(-1.0 - w as f32, -0.5, -1.0 - w as f32, false))
            .collect();
        let config = TableConfig::default();
        let mut bigrams = ProbeTable::new(1, &config).unwrap();
        bigrams
            .insert(MiddleEntry::new(
                hash_ngram(&[3, 4]),
                Weights::new(-0.7, -0.2, -0.6, false),
            ))
            .unwrap();
        let mut trigrams = ProbeTable::new(1, &config).unwrap();
        trigrams
            .insert(LongestEntry::new(hash_ngram(&[2, 3, 4]), -0.1))
            .unwrap();
        HashedSearch::new(3, unigrams, vec![bigrams], trigrams).unwrap()
    }

    #[test]
    fn test_hash_matches_incremental_walk() {
        let mut node = 4u64;
        node = combine_word_hash(node, 3);
        assert_eq!(node, hash_ngram(&[3, 4]));
        node = combine_word_hash(node, 2);
        assert_eq!(node, hash_ngram(&[2, 3, 4]));
        assert_eq!(hash_ngram(&[9]), 9);
    }

    #[test]
    fn test_two_phase_walk() {
        let search = tiny_search();
        let mut node = 0u64;
        let uni = search.lookup_unigram(4, &mut node);
        assert_eq!(uni.prob, -5.0);
        assert_eq!(uni.extend_left, 4);

        let it = search.lookup_middle_iterator(0, 3, &mut node);
        search.prefetch_middle(0, it);
        let hit = search.lookup_middle_from_iterator(0, node, it).unwrap();
        assert!((hit.prob - -0.7).abs() < 1e-6);
        assert_eq!(hit.extend_left, node);

        assert_eq!(search.lookup_longest(2, node), Some(-0.1));
        assert_eq!(search.lookup_longest(1, node), None);
    }

    #[test]
    fn test_middle_miss() {
        let search = tiny_search();
        let mut node = 0u64;
        search.lookup_unigram(4, &mut node);
        let it = search.lookup_middle_iterator(0, 1, &mut node);
        assert!(search.lookup_middle_from_iterator(0, node, it).is_none());
    }

    #[test]
    fn test_validate_rejects_wrong_middle_count() {
        let longest = ProbeTable::new(0, &TableConfig::default()).unwrap();
        let result = HashedSearch::new(4, vec![Weights::default(); 3], Vec::new(), longest);
        assert!(matches!(result, Err(ALICELMError::ModelError(_))));
    }

    #[test]
    fn test_counts() {
        let search = tiny_search();
        assert_eq!(search.counts(), vec![5, 1, 1]);
        assert_eq!(search.vocab_bound(), 5);
    }
}
