//! Reproducible synthetic models and query corpora
//!
//! N-grams are harvested from a random training corpus padded with `<s>` and
//! `</s>`, so every suffix and prefix of a stored n-gram is stored too. Half
//! of the query sentences replay training sentences to reach the higher
//! orders; the rest are fresh and mostly back off.

use crate::config::TableConfig;
use crate::model::{HashedModel, ModelBuilder, Vocabulary};
use crate::{ALICELMError, Result, WordIndex, MAX_ORDER};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Shape of a synthetic workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthSpec {
    pub order: u8,
    /// Vocabulary bound, specials included
    pub vocab_size: WordIndex,
    /// Query sentences to emit
    pub sentences: usize,
    /// Longest query sentence, `</s>` excluded
    pub max_sentence_len: usize,
    /// Sentences the n-grams are harvested from
    pub training_sentences: usize,
    pub seed: u64,
}

impl Default for SynthSpec {
    fn default() -> Self {
        Self {
            order: 5,
            vocab_size: 5000,
            sentences: 10000,
            max_sentence_len: 30,
            training_sentences: 5000,
            seed: 42,
        }
    }
}

impl SynthSpec {
    pub fn validate(&self) -> Result<()> {
        if self.order == 0 || self.order as usize > MAX_ORDER {
            return Err(ALICELMError::InvalidConfig(format!(
                "order must be in 1..={}",
                MAX_ORDER
            )));
        }
        if self.vocab_size < 4 {
            return Err(ALICELMError::InvalidConfig(
                "vocab_size must leave room for ordinary words".to_string(),
            ));
        }
        Ok(())
    }
}

/// Skewed draw from the ordinary words `3..bound`
fn draw_word(rng: &mut StdRng, bound: WordIndex) -> WordIndex {
    let span = (bound - 3) as f64;
    let u: f64 = rng.random();
    3 + ((u * u * span) as WordIndex).min(bound - 4)
}

fn draw_sentence(rng: &mut StdRng, bound: WordIndex, max_len: usize) -> Vec<WordIndex> {
    let len = rng.random_range(0..=max_len);
    (0..len).map(|_| draw_word(rng, bound)).collect()
}

/// Build a model and a query corpus (every sentence ends in `</s>`).
pub fn generate(spec: &SynthSpec, table: &TableConfig) -> Result<(HashedModel, Vec<WordIndex>)> {
    spec.validate()?;
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let vocab = Vocabulary::new(spec.vocab_size);
    let (bos, eos) = (vocab.begin_sentence(), vocab.end_sentence());
    let order = spec.order as usize;

    let mut builder = ModelBuilder::new(spec.order, vocab);
    for w in 0..spec.vocab_size {
        let prob = if w == bos { -99.0 } else { rng.random_range(-6.0..-1.0) };
        builder.unigram(w, prob, rng.random_range(-1.0..0.0));
    }

    let mut training = Vec::with_capacity(spec.training_sentences);
    for _ in 0..spec.training_sentences {
        let sentence = draw_sentence(&mut rng, spec.vocab_size, spec.max_sentence_len);
        let mut padded = Vec::with_capacity(sentence.len() + 2);
        padded.push(bos);
        padded.extend_from_slice(&sentence);
        padded.push(eos);
        for n in 2..=order {
            for window in padded.windows(n) {
                if builder.contains(window) {
                    continue;
                }
                let prob = rng.random_range(-3.0..-0.05);
                let backoff = if n < order {
                    rng.random_range(-1.0..0.0)
                } else {
                    0.0
                };
                builder.ngram(window, prob, backoff);
            }
        }
        training.push(sentence);
    }

    let mut corpus = Vec::new();
    for _ in 0..spec.sentences {
        if !training.is_empty() && rng.random_bool(0.5) {
            let pick = rng.random_range(0..training.len());
            corpus.extend_from_slice(&training[pick]);
        } else {
            corpus.extend(draw_sentence(&mut rng, spec.vocab_size, spec.max_sentence_len));
        }
        corpus.push(eos);
    }

    let model = builder.build(table)?;
    info!(
        "Synthesized order-{} model: counts {:?}, {} query words",
        spec.order,
        model.search().counts(),
        corpus.len()
    );
    Ok((model, corpus))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SynthSpec {
        SynthSpec {
            order: 3,
            vocab_size: 40,
            sentences: 50,
            max_sentence_len: 8,
            training_sentences: 30,
            seed: 7,
        }
    }

    #[test]
    fn test_reproducible() {
        let table = TableConfig::default();
        let (m1, c1) = generate(&small(), &table).unwrap();
        let (m2, c2) = generate(&small(), &table).unwrap();
        assert_eq!(c1, c2);
        assert_eq!(m1.search().counts(), m2.search().counts());
        assert_eq!(
            m1.score_sentence(&c1[..10]).to_bits(),
            m2.score_sentence(&c2[..10]).to_bits()
        );
    }

    #[test]
    fn test_corpus_shape() {
        let spec = small();
        let (model, corpus) = generate(&spec, &TableConfig::default()).unwrap();
        let eos = model.vocabulary().end_sentence();
        assert_eq!(corpus.last(), Some(&eos));
        assert_eq!(corpus.iter().filter(|&&w| w == eos).count(), spec.sentences);
        assert!(corpus.iter().all(|&w| w < spec.vocab_size && w != 1));
    }

    #[test]
    fn test_reaches_highest_order() {
        let (model, corpus) = generate(&small(), &TableConfig::default()).unwrap();
        let mut state = model.begin_sentence_state();
        let mut best = 0;
        for &w in &corpus {
            let (ret, next) = model.full_score(&state, w);
            best = best.max(ret.ngram_length);
            state = if w == 2 { model.begin_sentence_state() } else { next };
        }
        assert_eq!(best, 3);
    }

    #[test]
    fn test_rejects_tiny_vocabulary() {
        let spec = SynthSpec {
            vocab_size: 3,
            ..small()
        };
        assert!(generate(&spec, &TableConfig::default()).is_err());
    }
}
