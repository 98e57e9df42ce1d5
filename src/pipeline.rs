//! Latency-hiding scheduler over D sentence slots
//!
//! ```text
//! Fill:    init slot 0 .. slot k-1          (k = min(D, sentences))
//! Steady:  step slot i, i = (i + 1) mod k   (finished slot reloads)
//! Drain:   run each live slot to completion
//! ```
//!
//! Every `init`/`step` that issues a probe leaves its prefetch in flight
//! while the other `k - 1` slots are serviced.

use crate::config::PipelineConfig;
use crate::model::Model;
use crate::search::Search;
use crate::sentence::{Feed, Progress, Sentence};
use crate::{ALICELMError, Result, WordIndex};
use log::debug;
use std::time::{Duration, Instant};

/// Scores of one pipeline run, by sentence index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    /// Log-probability of each sentence, in input order
    pub sentence_scores: Vec<f32>,
    /// Words scored, `</s>` included
    pub words: u64,
    /// `run_state` calls issued
    pub steps: u64,
    /// Time spent inside `run`, summed over merged reports
    pub busy: Duration,
}

impl PipelineReport {
    pub fn sentences(&self) -> usize {
        self.sentence_scores.len()
    }

    /// Aggregate, summed in sentence order
    pub fn total(&self) -> f64 {
        self.sentence_scores.iter().map(|&s| s as f64).sum()
    }

    /// Append another report's sentences after this one's
    pub fn extend(&mut self, other: PipelineReport) {
        self.sentence_scores.extend(other.sentence_scores);
        self.words += other.words;
        self.steps += other.steps;
        self.busy += other.busy;
    }
}

/// Software pipeline owned by one worker
pub struct Pipeline<'m, S: Search> {
    slots: Vec<Sentence<'m, S>>,
}

impl<'m, S: Search> Pipeline<'m, S> {
    pub fn new(model: &'m Model<S>, config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let slots = (0..config.prefetch_depth)
            .map(|_| Sentence::new(model, config.max_sentence_words))
            .collect();
        Ok(Self { slots })
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Score every sentence of `input`. The stream must end with `</s>`.
    pub fn run<I>(&mut self, input: I) -> Result<PipelineReport>
    where
        I: IntoIterator<Item = Result<WordIndex>>,
    {
        let start = Instant::now();
        let mut input = input.into_iter();
        let mut report = PipelineReport::default();

        // Fill
        let mut width = 0;
        let mut exhausted = false;
        for slot in self.slots.iter_mut() {
            match slot.feed(&mut input)? {
                Feed::Ready => {
                    slot.begin(report.sentence_scores.len());
                    report.sentence_scores.push(0.0);
                    width += 1;
                }
                Feed::Exhausted => {
                    exhausted = true;
                    break;
                }
            }
        }
        if width == 0 {
            return Err(ALICELMError::MalformedInput(
                "no sentences in input".to_string(),
            ));
        }
        let ring = &mut self.slots[..width];

        // Steady
        let mut current = 0;
        while !exhausted {
            let slot = &mut ring[current];
            report.steps += 1;
            match slot.step() {
                Progress::Pending => {}
                Progress::Advanced => report.words += 1,
                Progress::Finished => {
                    report.words += 1;
                    report.sentence_scores[slot.index()] = slot.score();
                    slot.retire();
                    match slot.feed(&mut input)? {
                        Feed::Ready => {
                            slot.begin(report.sentence_scores.len());
                            report.sentence_scores.push(0.0);
                        }
                        Feed::Exhausted => exhausted = true,
                    }
                }
            }
            current += 1;
            if current == width {
                current = 0;
            }
        }

        // Drain
        for slot in ring.iter_mut().filter(|s| s.is_live()) {
            loop {
                report.steps += 1;
                match slot.step() {
                    Progress::Pending => {}
                    Progress::Advanced => report.words += 1,
                    Progress::Finished => {
                        report.words += 1;
                        report.sentence_scores[slot.index()] = slot.score();
                        slot.retire();
                        break;
                    }
                }
            }
        }

        report.busy = start.elapsed();
        debug!(
            "Pipeline depth {} (ring {}): {} sentences, {} words, {} steps",
            self.depth(),
            width,
            report.sentences(),
            report.words,
            report.steps
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synth::{self, SynthSpec};
    use crate::{HashedModel, TableConfig};

    fn workload(sentences: usize, seed: u64) -> (HashedModel, Vec<WordIndex>) {
        let spec = SynthSpec {
            order: 4,
            vocab_size: 60,
            sentences,
            max_sentence_len: 12,
            training_sentences: 200,
            seed,
        };
        synth::generate(&spec, &TableConfig::default()).unwrap()
    }

    fn reference(model: &HashedModel, corpus: &[WordIndex]) -> Vec<f32> {
        let eos = model.vocabulary().end_sentence();
        corpus
            .split_inclusive(|&w| w == eos)
            .map(|s| model.score_sentence(s))
            .collect()
    }

    fn run(model: &HashedModel, corpus: &[WordIndex], depth: usize) -> Result<PipelineReport> {
        let config = PipelineConfig::default().with_depth(depth);
        Pipeline::new(model, &config)?.run(corpus.iter().map(|&w| Ok(w)))
    }

    #[test]
    fn test_depth_is_score_neutral() {
        let (model, corpus) = workload(1000, 3);
        let base = run(&model, &corpus, 1).unwrap();
        assert_eq!(base.sentences(), 1000);
        assert_eq!(base.words as usize, corpus.len());
        for depth in [2, 4, 5, 16] {
            let report = run(&model, &corpus, depth).unwrap();
            assert_eq!(report.sentence_scores.len(), base.sentence_scores.len());
            for (a, b) in report.sentence_scores.iter().zip(&base.sentence_scores) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
            assert_eq!(report.total().to_bits(), base.total().to_bits());
            assert_eq!(report.steps, base.steps);
        }
    }

    #[test]
    fn test_matches_sequential_scoring() {
        let (model, corpus) = workload(200, 9);
        let expected = reference(&model, &corpus);
        let report = run(&model, &corpus, 4).unwrap();
        assert_eq!(report.sentence_scores.len(), expected.len());
        for (a, b) in report.sentence_scores.iter().zip(&expected) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_fewer_sentences_than_depth() {
        let depth = 6;
        for sentences in 1..=depth {
            let (model, corpus) = workload(sentences, 20 + sentences as u64);
            let expected = reference(&model, &corpus);
            for d in 1..=depth {
                let report = run(&model, &corpus, d).unwrap();
                assert_eq!(report.sentences(), sentences);
                for (a, b) in report.sentence_scores.iter().zip(&expected) {
                    assert_eq!(a.to_bits(), b.to_bits());
                }
            }
        }
    }

    #[test]
    fn test_single_end_sentence() {
        let (model, _) = workload(1, 1);
        let eos = model.vocabulary().end_sentence();
        let report = run(&model, &[eos], 3).unwrap();
        assert_eq!(report.sentences(), 1);
        assert_eq!(report.words, 1);
    }

    #[test]
    fn test_unterminated_input_rejected() {
        let (model, mut corpus) = workload(10, 5);
        corpus.push(3);
        for depth in [1, 4, 32] {
            assert!(matches!(
                run(&model, &corpus, depth),
                Err(ALICELMError::MalformedInput(_))
            ));
        }
    }

    #[test]
    fn test_empty_input_rejected() {
        let (model, _) = workload(1, 1);
        assert!(matches!(
            run(&model, &[], 2),
            Err(ALICELMError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_sentence_too_long() {
        let (model, _) = workload(1, 1);
        let eos = model.vocabulary().end_sentence();
        let mut corpus = vec![3; 10];
        corpus.push(eos);
        let config = PipelineConfig {
            max_sentence_words: 8,
            ..PipelineConfig::default()
        };
        let result = Pipeline::new(&model, &config)
            .unwrap()
            .run(corpus.iter().map(|&w| Ok(w)));
        assert!(matches!(
            result,
            Err(ALICELMError::SentenceTooLong { limit: 8 })
        ));
    }

    #[test]
    fn test_zero_depth_rejected() {
        let (model, _) = workload(1, 1);
        let config = PipelineConfig::default().with_depth(0);
        assert!(matches!(
            Pipeline::new(&model, &config),
            Err(ALICELMError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_custom_special_ids() {
        use crate::driver::Driver;
        use crate::model::{ModelBuilder, Vocabulary};

        // <unk>=9 <s>=7 </s>=4; 2 is an ordinary word here
        let vocab = Vocabulary::with_specials(10, 9, 7, 4);
        let mut b = ModelBuilder::new(3, vocab);
        b.unigram(9, -3.0, 0.0).unigram(7, -99.0, -0.5).unigram(4, -1.0, 0.0);
        b.unigram(2, -1.4, -0.3).unigram(3, -1.6, -0.2).unigram(5, -2.0, -0.1);
        b.ngram(&[7, 2], -0.5, -0.2).ngram(&[2, 3], -0.6, -0.1).ngram(&[3, 4], -0.4, 0.0);
        b.ngram(&[7, 2, 3], -0.3, 0.0);
        let model = b.build(&TableConfig::default()).unwrap();
        assert_eq!(model.begin_sentence_state().words[0], 7);

        let corpus = [2, 3, 4, 3, 2, 5, 4, 4, 0, 2, 3, 4];
        let expected = reference(&model, &corpus);
        assert_eq!(expected.len(), 4);
        // p(2|<s>) + p(3|<s> 2) + b(2 3) + p(</s>|3)
        assert!((expected[0] - (-0.5 + -0.3 + -0.1 + -0.4)).abs() < 1e-5);

        for depth in 1..=4 {
            let report = run(&model, &corpus, depth).unwrap();
            assert_eq!(report.sentences(), 4);
            assert_eq!(report.words as usize, corpus.len());
            for (a, b) in report.sentence_scores.iter().zip(&expected) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }

        let sum: f64 = expected.iter().map(|&s| s as f64).sum();
        let driver = Driver::new(&model, PipelineConfig::default().with_depth(2).with_threads(3)).unwrap();
        let report = driver.run_words(&corpus).unwrap();
        assert_eq!(report.total.to_bits(), sum.to_bits());
        assert_eq!(report.sentences, 4);

        // ending on the default </s> id is an unterminated sentence here
        assert!(matches!(
            run(&model, &[2, 3, 2], 2),
            Err(ALICELMError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_oversized_config_rejected() {
        let (model, corpus) = workload(3, 2);
        let huge_buffer = PipelineConfig {
            max_sentence_words: usize::MAX,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            Pipeline::new(&model, &huge_buffer),
            Err(ALICELMError::InvalidConfig(_))
        ));
        let huge_depth = PipelineConfig::default().with_depth(usize::MAX);
        assert!(matches!(
            Pipeline::new(&model, &huge_depth),
            Err(ALICELMError::InvalidConfig(_))
        ));

        // the largest accepted values still build and score
        let widest = PipelineConfig {
            prefetch_depth: crate::config::MAX_PREFETCH_DEPTH,
            max_sentence_words: crate::config::MAX_SENTENCE_WORDS,
            ..PipelineConfig::default()
        };
        let mut pipeline = Pipeline::new(&model, &widest).unwrap();
        assert_eq!(pipeline.depth(), crate::config::MAX_PREFETCH_DEPTH);
        let report = pipeline.run(corpus.iter().map(|&w| Ok(w))).unwrap();
        assert_eq!(report.sentences(), 3);
    }
}
