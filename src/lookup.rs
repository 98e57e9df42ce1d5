//! Incremental per-word lookup state machine
//!
//! Scoring one word walks the model one order at a time:
//!
//! ```text
//! Unigram ──▶ Middle(2) ──▶ … ──▶ Middle(N-1) ──▶ Longest(N) ──▶ Final
//!    │            │                    │
//!    └── miss / context exhausted / independent left ──────────▶ Final
//! ```
//!
//! Each arrow that needs a hash probe is split in two: the address of the
//! next order is computed and prefetched at the end of one step, and the
//! probe is completed at the start of the next. Between the two the caller
//! is free to advance other lookups, which is what hides the cache miss.

use crate::search::Search;
use crate::weights::{has_extension, ScoreResult, State};
use crate::{WordIndex, MAX_ORDER};

/// Outcome of one state machine step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A prefetch is in flight; call `run_state` again later
    Continue,
    /// Score and out-state are final
    Done,
}

/// Reusable lookup for one (state, word) query at a time
pub struct Lookup<'m, S: Search> {
    search: &'m S,
    order: u8,

    context: [WordIndex; MAX_ORDER - 1],
    context_len: usize,
    /// Next context word to fold in
    hist: usize,
    order_minus_2: u8,
    node: S::Node,
    iter: S::MiddleIter,
    finished: bool,

    ret: ScoreResult,
    out_state: State,
}

impl<'m, S: Search> Lookup<'m, S> {
    pub fn new(search: &'m S) -> Self {
        Self {
            search,
            order: search.order(),
            context: [0; MAX_ORDER - 1],
            context_len: 0,
            hist: 0,
            order_minus_2: 0,
            node: S::Node::default(),
            iter: S::MiddleIter::default(),
            finished: true,
            ret: ScoreResult::default(),
            out_state: State::default(),
        }
    }

    /// Start scoring `word` after `context` (most recent word first).
    ///
    /// Performs the unigram lookup and, when there is context to extend,
    /// prefetches the bigram bucket. Returns `Done` when no longer order can
    /// apply.
    ///
    /// # Panics
    ///
    /// If `word` is at or above the backend's vocabulary bound.
    pub fn init(&mut self, context: &[WordIndex], word: WordIndex) -> Step {
        let max_context = (self.order as usize).saturating_sub(1);
        let context = &context[..context.len().min(max_context)];
        self.context[..context.len()].copy_from_slice(context);
        self.context_len = context.len();
        self.hist = 0;
        self.order_minus_2 = 0;
        self.node = S::Node::default();
        self.iter = S::MiddleIter::default();
        self.finished = false;

        let uni = self.search.lookup_unigram(word, &mut self.node);
        self.ret = ScoreResult {
            prob: uni.prob,
            rest: uni.rest,
            ngram_length: 1,
            independent_left: uni.independent_left,
            extend_left: uni.extend_left,
        };

        self.out_state = State::default();
        if max_context > 0 {
            self.out_state.words[0] = word;
            self.out_state.backoff[0] = uni.backoff;
            self.out_state.length = if has_extension(uni.backoff) { 1 } else { 0 };
        }

        if self.context_len == 0 {
            self.finish();
            return Step::Done;
        }
        if self.order > 2 {
            self.issue_middle();
        }
        Step::Continue
    }

    /// Advance by one order. Idempotent once `Done`.
    pub fn run_state(&mut self) -> Step {
        if self.finished {
            return Step::Done;
        }
        if self.hist == self.context_len || self.ret.independent_left {
            self.finish();
            return Step::Done;
        }
        if self.order_minus_2 + 2 == self.order {
            self.longest();
            self.finish();
            return Step::Done;
        }

        let hit = match self
            .search
            .lookup_middle_from_iterator(self.order_minus_2, self.node, self.iter)
        {
            Some(hit) => hit,
            None => {
                self.ret.independent_left = true;
                self.finish();
                return Step::Done;
            }
        };

        let ngram_length = self.order_minus_2 + 2;
        self.out_state.backoff[ngram_length as usize - 1] = hit.backoff;
        self.ret.prob = hit.prob;
        self.ret.rest = hit.rest;
        self.ret.ngram_length = ngram_length;
        self.ret.independent_left = hit.independent_left;
        self.ret.extend_left = hit.extend_left;
        if has_extension(hit.backoff) {
            self.out_state.length = ngram_length;
        }

        self.order_minus_2 += 1;
        self.hist += 1;
        if self.hist != self.context_len && self.order_minus_2 + 2 != self.order {
            self.issue_middle();
        }
        Step::Continue
    }

    /// Drive to completion without interleaving.
    pub fn run_to_end(&mut self, context: &[WordIndex], word: WordIndex) -> (ScoreResult, State) {
        if self.init(context, word) == Step::Continue {
            while self.run_state() == Step::Continue {}
        }
        (self.ret, self.out_state)
    }

    /// Score so far; excludes the in-state backoff
    pub fn result(&self) -> &ScoreResult {
        &self.ret
    }

    pub fn out_state(&self) -> &State {
        &self.out_state
    }

    pub fn is_done(&self) -> bool {
        self.finished
    }

    #[inline(always)]
    fn issue_middle(&mut self) {
        self.iter = self.search.lookup_middle_iterator(
            self.order_minus_2,
            self.context[self.hist],
            &mut self.node,
        );
        self.search.prefetch_middle(self.order_minus_2, self.iter);
    }

    fn longest(&mut self) {
        self.ret.independent_left = true;
        if let Some(prob) = self.search.lookup_longest(self.context[self.hist], self.node) {
            self.ret.prob = prob;
            self.ret.rest = prob;
            self.ret.ngram_length = self.order;
        }
    }

    /// Carry the context words the out-state still needs.
    fn finish(&mut self) {
        let keep = (self.out_state.length as usize).saturating_sub(1);
        self.out_state.words[1..1 + keep].copy_from_slice(&self.context[..keep]);
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelBuilder, Vocabulary};
    use crate::weights::NO_EXTENSION_BACKOFF;
    use crate::{HashedModel, TableConfig};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    // <unk>=0 <s>=1 </s>=2, words 3..8
    fn trigram_model() -> HashedModel {
        let mut b = ModelBuilder::new(3, Vocabulary::new(8));
        b.unigram(0, -3.0, 0.0);
        b.unigram(1, -99.0, -0.4);
        b.unigram(2, -1.0, 0.0);
        for w in 3..8 {
            b.unigram(w, -2.0 - 0.1 * w as f32, -0.3);
        }
        b.ngram(&[1, 3], -0.9, -0.2);
        b.ngram(&[3, 4], -0.8, -0.25);
        b.ngram(&[4, 5], -0.6, -0.15);
        b.ngram(&[1, 3, 4], -0.3, 0.0);
        b.ngram(&[3, 4, 5], -0.2, 0.0);
        b.build(&TableConfig::default()).unwrap()
    }

    #[test]
    fn test_unigram_only_context() {
        let model = trigram_model();
        let mut lookup = Lookup::new(model.search());
        assert_eq!(lookup.init(&[], 5), Step::Done);
        assert!(lookup.is_done());
        assert_eq!(lookup.result().ngram_length, 1);
        assert!((lookup.result().prob - -2.5).abs() < 1e-6);
        assert_eq!(lookup.run_state(), Step::Done);
    }

    #[test]
    fn test_trigram_hit() {
        let model = trigram_model();
        let mut lookup = Lookup::new(model.search());
        // context "3 4" most recent first
        let (ret, out) = lookup.run_to_end(&[4, 3], 5);
        assert_eq!(ret.ngram_length, 3);
        assert!((ret.prob - -0.2).abs() < 1e-6);
        assert!(ret.independent_left);
        assert_eq!(out.words[0], 5);
        assert_eq!(out.words[1], 4);
        assert_eq!(out.length, 2);
        assert!((out.backoff[1] - -0.15).abs() < 1e-6);
    }

    #[test]
    fn test_backoff_to_bigram() {
        let model = trigram_model();
        // context "6 4": trigram (6 4 5) absent, bigram (4 5) present
        let mut in_state = model.null_context_state();
        in_state.words[0] = 4;
        in_state.words[1] = 6;
        in_state.backoff[0] = -0.3;
        in_state.backoff[1] = -0.05;
        in_state.length = 2;

        let mut lookup = Lookup::new(model.search());
        let (ret, _) = lookup.run_to_end(in_state.context(), 5);
        assert_eq!(ret.ngram_length, 2);
        assert!((ret.prob - -0.6).abs() < 1e-6);

        let (full, _) = model.full_score(&in_state, 5);
        assert!((full.prob - (-0.6 + -0.05)).abs() < 1e-6);
    }

    #[test]
    fn test_out_state_shrinks_without_extension() {
        let model = trigram_model();
        let mut lookup = Lookup::new(model.search());
        // </s> has backoff 0 and no bigram starting with it
        let (_, out) = lookup.run_to_end(&[], 2);
        assert_eq!(out.backoff[0].to_bits(), NO_EXTENSION_BACKOFF.to_bits());
        assert_eq!(out.length, 0);
    }

    #[test]
    fn test_idempotent_rerun() {
        let model = trigram_model();
        let mut lookup = Lookup::new(model.search());
        let first = lookup.run_to_end(&[3, 1], 4);
        let second = lookup.run_to_end(&[3, 1], 4);
        assert_eq!(first, second);
        assert_eq!(first.0.ngram_length, 3);
    }

    #[test]
    fn test_ngram_length_bounded_by_context() {
        let model = trigram_model();
        let mut lookup = Lookup::new(model.search());
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..2000 {
            let len = rng.random_range(0..=2usize);
            let context: Vec<WordIndex> = (0..len).map(|_| rng.random_range(0..8)).collect();
            let word = rng.random_range(0..8);
            let (ret, out) = lookup.run_to_end(&context, word);
            assert!(ret.ngram_length as usize <= len + 1);
            assert!(ret.ngram_length <= model.order());
            assert!(out.length < model.order());
            assert!(out.length <= ret.ngram_length.max(1));
        }
    }

    #[test]
    fn test_long_context_truncated_to_order() {
        let model = trigram_model();
        let mut lookup = Lookup::new(model.search());
        let (ret, _) = lookup.run_to_end(&[4, 3, 1, 7], 5);
        assert_eq!(ret.ngram_length, 3);
    }
}
