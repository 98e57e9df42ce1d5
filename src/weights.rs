//! Log-domain weights, query state and score results
//!
//! Two flags ride inside the float bits:
//!
//! - **Independent left**: a stored middle/unigram probability with its sign
//!   bit *clear* means no longer n-gram extends it to the left. Real log
//!   probabilities are never positive, so `prob()` restores the sign.
//! - **No extension**: a backoff of exactly `-0.0` means the n-gram is not the
//!   context of any longer n-gram, so a state ending in it can be shortened.

use crate::{WordIndex, MAX_ORDER};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Backoff bit pattern meaning "no right extension"
pub const NO_EXTENSION_BACKOFF: f32 = -0.0;

/// Backoff for an extensible n-gram with zero weight
pub const EXTENSION_BACKOFF: f32 = 0.0;

/// Probability assigned to vocabulary words without a unigram entry
pub const UNKNOWN_PROB: f32 = -100.0;

/// Whether a state ending in an n-gram with this backoff stays informative
#[inline(always)]
pub fn has_extension(backoff: f32) -> bool {
    backoff.to_bits() != NO_EXTENSION_BACKOFF.to_bits()
}

/// Force the sign bit on
#[inline(always)]
pub fn set_sign(value: f32) -> f32 {
    f32::from_bits(value.to_bits() | 0x8000_0000)
}

/// Force the sign bit off
#[inline(always)]
pub fn unset_sign(value: f32) -> f32 {
    f32::from_bits(value.to_bits() & 0x7fff_ffff)
}

/// Stored weights of a unigram or middle-order n-gram
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable, Serialize, Deserialize)]
pub struct Weights {
    /// Log probability, sign bit doubling as the independent-left flag
    pub prob: f32,
    pub backoff: f32,
    pub rest: f32,
}

impl Weights {
    /// Pack weights, encoding the independent-left flag.
    pub fn new(prob: f32, backoff: f32, rest: f32, independent_left: bool) -> Self {
        Self {
            prob: if independent_left {
                unset_sign(prob)
            } else {
                set_sign(prob)
            },
            backoff,
            rest,
        }
    }

    #[inline(always)]
    pub fn prob(&self) -> f32 {
        set_sign(self.prob)
    }

    #[inline(always)]
    pub fn backoff(&self) -> f32 {
        self.backoff
    }

    #[inline(always)]
    pub fn rest(&self) -> f32 {
        self.rest
    }

    #[inline(always)]
    pub fn independent_left(&self) -> bool {
        !self.prob.is_sign_negative()
    }
}

/// Context carried from one word to the next
///
/// `words[0..length)` are the most recent words, nearest first;
/// `backoff[i]` is the backoff of the n-gram `words[0..=i]` read oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct State {
    pub words: [WordIndex; MAX_ORDER - 1],
    pub backoff: [f32; MAX_ORDER - 1],
    pub length: u8,
}

impl State {
    /// Usable context, most recent word first
    #[inline]
    pub fn context(&self) -> &[WordIndex] {
        &self.words[..self.length as usize]
    }

    /// Backoff owed by a match of `ngram_length` against this context:
    /// the backoffs of every context order the match did not reach.
    #[inline]
    pub fn backoff_from(&self, ngram_length: u8) -> f32 {
        let start = (ngram_length as usize).saturating_sub(1);
        let end = self.length as usize;
        let mut total = 0.0f32;
        if start < end {
            for b in &self.backoff[start..end] {
                total += *b;
            }
        }
        total
    }
}

/// Result of scoring one word against one state
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoreResult {
    /// Log probability of the longest match; excludes context backoff
    /// until folded in by the caller
    pub prob: f32,
    /// Rest cost estimate carried through from the backend
    pub rest: f32,
    /// Longest matched order
    pub ngram_length: u8,
    /// No further leftward extension is possible
    pub independent_left: bool,
    /// Opaque continuation token of the longest match
    pub extend_left: u64,
}
