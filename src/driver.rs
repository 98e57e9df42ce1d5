//! Corpus driver: partition, fan out, combine
//!
//! The corpus is cut at `</s>` boundaries into one contiguous chunk per
//! worker; each worker runs its own [`Pipeline`] against the shared model.
//! Chunk reports are concatenated in chunk order, so the aggregate is summed
//! in sentence order whatever the thread count.

use crate::config::PipelineConfig;
use crate::model::Model;
use crate::pipeline::{Pipeline, PipelineReport};
use crate::search::Search;
use crate::word_stream::{decode_words, WordReader};
use crate::{ALICELMError, Result, WordIndex};
use log::{debug, info};
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::Path;
use std::time::{Duration, Instant};

/// Outcome of a full run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Aggregate log-probability
    pub total: f64,
    pub sentences: usize,
    pub words: u64,
    pub steps: u64,
    /// Wall time of the whole run
    pub elapsed: Duration,
    /// Worker time: each pipeline's time inside `run`, summed over threads
    pub busy: Duration,
    pub threads: usize,
    pub prefetch_depth: usize,
}

impl RunReport {
    fn from_pipeline(report: PipelineReport, elapsed: Duration, config: &PipelineConfig, threads: usize) -> Self {
        Self {
            total: report.total(),
            sentences: report.sentences(),
            words: report.words,
            steps: report.steps,
            busy: report.busy,
            elapsed,
            threads,
            prefetch_depth: config.prefetch_depth,
        }
    }

    pub fn words_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.words as f64 / secs
        } else {
            0.0
        }
    }
}

/// Split `words` into at most `parts` ranges, each ending in `eos`.
pub fn partition(words: &[WordIndex], eos: WordIndex, parts: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 1..parts {
        let target = (words.len() * i / parts).max(start + 1);
        if target > words.len() {
            break;
        }
        let end = match words[target - 1..].iter().position(|&w| w == eos) {
            Some(p) => target + p,
            None => break,
        };
        if end >= words.len() {
            break;
        }
        ranges.push(start..end);
        start = end;
    }
    if start < words.len() {
        ranges.push(start..words.len());
    }
    ranges
}

/// Runs corpora against one model
///
/// Multi-threaded drivers own their worker pool; it is built once and
/// reused by every run.
pub struct Driver<'m, S: Search> {
    model: &'m Model<S>,
    config: PipelineConfig,
    pool: Option<rayon::ThreadPool>,
}

impl<'m, S: Search> Driver<'m, S> {
    pub fn new(model: &'m Model<S>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let pool = if config.threads > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(config.threads)
                .thread_name(|i| format!("alice-lm-{}", i))
                .build()
                .map_err(|e| ALICELMError::InvalidConfig(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self { model, config, pool })
    }

    /// Score an in-memory corpus.
    pub fn run_words(&self, words: &[WordIndex]) -> Result<RunReport> {
        let eos = self.model.vocabulary().end_sentence();
        match words.last() {
            None => {
                return Err(ALICELMError::MalformedInput(
                    "empty input".to_string(),
                ))
            }
            Some(&last) if last != eos => {
                return Err(ALICELMError::MalformedInput(format!(
                    "input ends with word {} instead of </s>",
                    last
                )))
            }
            Some(_) => {}
        }

        let start = Instant::now();
        let ranges = partition(words, eos, self.config.threads);
        debug!("Partitioned {} words into {} chunks", words.len(), ranges.len());

        let report = match &self.pool {
            Some(pool) if ranges.len() > 1 => {
                let chunks: Vec<PipelineReport> = pool.install(|| {
                    ranges
                        .par_iter()
                        .map(|r| self.run_chunk(&words[r.clone()]))
                        .collect::<Result<Vec<_>>>()
                })?;
                let mut combined = PipelineReport::default();
                for chunk in chunks {
                    combined.extend(chunk);
                }
                combined
            }
            _ => self.run_chunk(words)?,
        };

        let run = RunReport::from_pipeline(report, start.elapsed(), &self.config, ranges.len());
        self.log_report(&run);
        Ok(run)
    }

    /// Score a little-endian byte corpus at the vocabulary's width.
    pub fn run_bytes(&self, bytes: &[u8]) -> Result<RunReport> {
        let words = decode_words(bytes, self.model.vocabulary().width())?;
        self.run_words(&words)
    }

    /// Score a corpus file through a read-only memory map.
    pub fn run_file<P: AsRef<Path>>(&self, path: P) -> Result<RunReport> {
        let file = File::open(path.as_ref())?;
        if file.metadata()?.len() == 0 {
            return Err(ALICELMError::MalformedInput("empty input".to_string()));
        }
        // SAFETY: mapped read-only and only read for the duration of the run.
        let mmap = unsafe { Mmap::map(&file)? };
        info!("Scoring {} ({} bytes)", path.as_ref().display(), mmap.len());
        self.run_bytes(&mmap[..])
    }

    /// Score a stream (pipe or stdin). Multi-threaded runs buffer the
    /// whole stream first; a single thread scores as it reads.
    pub fn run_stream<R: Read>(&self, mut reader: R) -> Result<RunReport> {
        if self.config.threads > 1 {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            return self.run_bytes(&bytes);
        }

        let start = Instant::now();
        let words = WordReader::new(reader, self.model.vocabulary().width());
        let report = Pipeline::new(self.model, &self.config)?.run(words)?;
        let run = RunReport::from_pipeline(report, start.elapsed(), &self.config, 1);
        self.log_report(&run);
        Ok(run)
    }

    fn run_chunk(&self, words: &[WordIndex]) -> Result<PipelineReport> {
        let mut pipeline = Pipeline::new(self.model, &self.config)?;
        pipeline.run(words.iter().map(|&w| Ok(w)))
    }

    fn log_report(&self, run: &RunReport) {
        info!(
            "Scored {} sentences, {} words in {:.3}s, {:.3}s worker time ({:.0} words/s, depth {}, {} threads)",
            run.sentences,
            run.words,
            run.elapsed.as_secs_f64(),
            run.busy.as_secs_f64(),
            run.words_per_second(),
            run.prefetch_depth,
            run.threads
        );
    }
}
