//! One pipeline slot: a sentence buffer plus its in-flight lookup

use crate::config::DEFAULT_MAX_SENTENCE_WORDS;
use crate::lookup::{Lookup, Step};
use crate::model::Model;
use crate::search::Search;
use crate::weights::State;
use crate::{ALICELMError, Result, WordIndex};

/// Outcome of loading the next sentence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// A complete sentence ending in `</s>` is buffered
    Ready,
    /// Input ended cleanly at a sentence boundary
    Exhausted,
}

/// Outcome of one slot step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Current word still has a probe in flight
    Pending,
    /// A word was scored and the next one initialised
    Advanced,
    /// The last word (`</s>`) was scored
    Finished,
}

/// Fixed-capacity sentence slot
///
/// The buffer starts small and grows up to `capacity` as long sentences
/// arrive; it is reused across sentences.
pub struct Sentence<'m, S: Search> {
    model: &'m Model<S>,
    lookup: Lookup<'m, S>,
    words: Vec<WordIndex>,
    capacity: usize,

    index: usize,
    pos: usize,
    state: State,
    score: f32,
    live: bool,
}

impl<'m, S: Search> Sentence<'m, S> {
    pub fn new(model: &'m Model<S>, capacity: usize) -> Self {
        Self {
            model,
            lookup: model.lookup(),
            words: Vec::with_capacity(capacity.min(DEFAULT_MAX_SENTENCE_WORDS)),
            capacity,
            index: 0,
            pos: 0,
            state: model.begin_sentence_state(),
            score: 0.0,
            live: false,
        }
    }

    /// Buffer words from `input` up to and including the next `</s>`.
    pub fn feed<I>(&mut self, input: &mut I) -> Result<Feed>
    where
        I: Iterator<Item = Result<WordIndex>>,
    {
        let vocab = *self.model.vocabulary();
        self.words.clear();
        self.live = false;
        loop {
            let word = match input.next() {
                Some(word) => word?,
                None if self.words.is_empty() => return Ok(Feed::Exhausted),
                None => {
                    return Err(ALICELMError::MalformedInput(format!(
                        "input ends inside a sentence of {} words without </s>",
                        self.words.len()
                    )))
                }
            };
            vocab.check(word)?;
            if self.words.len() == self.capacity {
                return Err(ALICELMError::SentenceTooLong {
                    limit: self.capacity,
                });
            }
            self.words.push(word);
            if word == vocab.end_sentence() {
                return Ok(Feed::Ready);
            }
        }
    }

    /// Start scoring the buffered sentence as sentence number `index`.
    pub fn begin(&mut self, index: usize) {
        self.index = index;
        self.pos = 0;
        self.state = self.model.begin_sentence_state();
        self.score = 0.0;
        self.live = !self.words.is_empty();
        if self.live {
            self.lookup.init(self.state.context(), self.words[0]);
        }
    }

    /// Advance the in-flight lookup by one order.
    pub fn step(&mut self) -> Progress {
        if self.lookup.run_state() == Step::Continue {
            return Progress::Pending;
        }

        let ret = *self.lookup.result();
        self.score += ret.prob + self.state.backoff_from(ret.ngram_length);
        self.state = *self.lookup.out_state();
        self.pos += 1;
        if self.pos < self.words.len() {
            self.lookup.init(self.state.context(), self.words[self.pos]);
            Progress::Advanced
        } else {
            Progress::Finished
        }
    }

    /// Mark the slot idle after its score has been collected.
    pub fn retire(&mut self) {
        self.live = false;
    }

    /// Sum of full scores so far
    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn words(&self) -> &[WordIndex] {
        &self.words
    }

    pub fn is_live(&self) -> bool {
        self.live
    }
}
