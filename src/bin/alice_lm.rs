//! ALICE-LM CLI
//!
//! Command-line interface for the ALICE-LM query engine.

use alice_lm::{
    encode_words, synth, table_bench, BucketMode, Driver, HashedModel, PipelineConfig, SynthSpec,
    TableBenchSpec, TableConfig,
};
use clap::{Parser, Subcommand};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "alice-lm")]
#[command(author = "Moroya Sakamoto")]
#[command(version = "1.0.0")]
#[command(about = "Pipelined n-gram language model queries - Hide probe latency, not predictions")]
#[command(long_about = r#"
ALICE-LM: Pipelined n-gram Language Model Queries

Principle:
  Word → Locate bucket → Prefetch → (serve other sentences) → Complete probe
    → Hit  → try the next longer order
    → Miss → back off to the longest match

Memory latency is hidden, not avoided.
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic model image and query corpus
    Synth {
        /// Output model image
        #[arg(short, long, default_value = "synth.alm")]
        model: PathBuf,

        /// Output corpus of word ids
        #[arg(short, long, default_value = "synth.words")]
        corpus: PathBuf,

        /// Model order
        #[arg(long, default_value_t = 5)]
        order: u8,

        /// Vocabulary size, <unk> <s> </s> included
        #[arg(long, default_value_t = 5000)]
        vocab: u32,

        /// Query sentences
        #[arg(long, default_value_t = 10000)]
        sentences: usize,

        /// Training sentences the n-grams come from
        #[arg(long, default_value_t = 5000)]
        training: usize,

        /// Longest sentence in words
        #[arg(long, default_value_t = 30)]
        max_len: usize,

        /// Random seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Probe table oversizing factor
        #[arg(long, default_value_t = 1.5)]
        multiplier: f32,

        /// Bucket reduction: divide, mask
        #[arg(long, default_value = "divide")]
        bucket_mode: String,
    },

    /// Score a corpus of word ids
    Query {
        /// Model image (.alm)
        model: PathBuf,

        /// Corpus file (use - for stdin)
        input: PathBuf,

        /// Sentences in flight per thread
        #[arg(short, long)]
        depth: Option<usize>,

        /// Worker threads
        #[arg(short, long)]
        threads: Option<usize>,

        /// Pipeline configuration (JSON); flags override it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show model information
    Info {
        /// Model image (.alm)
        model: PathBuf,
    },

    /// Benchmark the probe table
    TableBench {
        /// Keys inserted
        #[arg(long, default_value_t = 1 << 20)]
        entries: usize,

        /// Lookups issued
        #[arg(long, default_value_t = 1 << 22)]
        lookups: usize,

        /// Table oversizing factor
        #[arg(long, default_value_t = 1.5)]
        multiplier: f32,

        /// Lookups in flight between locate and complete
        #[arg(long, default_value_t = 8)]
        queue_depth: usize,

        /// Random seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Synth {
            model,
            corpus,
            order,
            vocab,
            sentences,
            training,
            max_len,
            seed,
            multiplier,
            bucket_mode,
        } => {
            let spec = SynthSpec {
                order,
                vocab_size: vocab,
                sentences,
                max_sentence_len: max_len,
                training_sentences: training,
                seed,
            };
            let table = TableConfig {
                multiplier,
                bucket_mode: BucketMode::parse(&bucket_mode)?,
            };
            write_synth(&spec, &table, &model, &corpus)?;
        }
        Commands::Query {
            model,
            input,
            depth,
            threads,
            config,
            verbose,
        } => {
            query_corpus(&model, &input, depth, threads, config, verbose)?;
        }
        Commands::Info { model } => {
            show_info(&model)?;
        }
        Commands::TableBench {
            entries,
            lookups,
            multiplier,
            queue_depth,
            seed,
        } => {
            let spec = TableBenchSpec {
                entries,
                lookups,
                multiplier,
                queue_depth,
                seed,
                ..TableBenchSpec::default()
            };
            bench_table(&spec)?;
        }
    }

    Ok(())
}

fn write_synth(
    spec: &SynthSpec,
    table: &TableConfig,
    model_path: &PathBuf,
    corpus_path: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    let (model, corpus) = synth::generate(spec, table)?;
    model.save(model_path)?;
    let bytes = encode_words(&corpus, model.vocabulary().width())?;
    fs::write(corpus_path, &bytes)?;

    println!("ALICE-LM Synthetic Workload");
    println!("===========================");
    println!("Model:      {}", model_path.display());
    println!("Corpus:     {}", corpus_path.display());
    println!("Order:      {}", spec.order);
    println!("Counts:     {:?}", model.search().counts());
    println!("Sentences:  {}", spec.sentences);
    println!("Words:      {}", corpus.len());
    println!("Width:      {} bytes", model.vocabulary().width().bytes());
    println!("Time:       {:.2}ms", start.elapsed().as_secs_f64() * 1000.0);
    Ok(())
}

fn query_corpus(
    model_path: &PathBuf,
    input: &PathBuf,
    depth: Option<usize>,
    threads: Option<usize>,
    config_path: Option<PathBuf>,
    verbose: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(depth) = depth {
        config.prefetch_depth = depth;
    }
    if let Some(threads) = threads {
        config.threads = threads;
    }

    let load_start = Instant::now();
    let model = HashedModel::open(model_path)?;
    let load_time = load_start.elapsed();

    let driver = Driver::new(&model, config)?;
    let report = if input.to_string_lossy() == "-" {
        driver.run_stream(io::stdin().lock())?
    } else {
        driver.run_file(input)?
    };

    println!("Sum is {}", report.total);
    if verbose {
        println!();
        println!("ALICE-LM Query");
        println!("==============");
        println!("Model:      {}", model_path.display());
        println!("Input:      {}", input.display());
        println!("Order:      {}", model.order());
        println!("Depth:      {}", report.prefetch_depth);
        println!("Threads:    {}", report.threads);
        println!();
        println!("Sentences:  {}", report.sentences);
        println!("Words:      {}", report.words);
        println!("Steps:      {}", report.steps);
        println!("Load:       {:.2}ms", load_time.as_secs_f64() * 1000.0);
        println!("Query:      {:.2}ms", report.elapsed.as_secs_f64() * 1000.0);
        println!("Worker:     {:.2}ms", report.busy.as_secs_f64() * 1000.0);
        println!("Throughput: {:.0} words/s", report.words_per_second());
    } else {
        println!(
            "{} words in {:.2}ms ({:.0} words/s)",
            report.words,
            report.elapsed.as_secs_f64() * 1000.0,
            report.words_per_second()
        );
    }
    Ok(())
}

fn show_info(model_path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let model = HashedModel::open(model_path)?;
    let vocab = model.vocabulary();
    let file_size = fs::metadata(model_path)?.len();

    println!("ALICE-LM Model Information");
    println!("==========================");
    println!("File:            {}", model_path.display());
    println!("Image Size:      {} bytes", file_size);
    println!("Order:           {}", model.order());
    println!("Vocabulary:      {}", vocab.bound());
    println!("Word Width:      {} bytes", vocab.width().bytes());
    println!(
        "Specials:        <unk>={} <s>={} </s>={}",
        vocab.unknown(),
        vocab.begin_sentence(),
        vocab.end_sentence()
    );
    println!();
    println!("Tables:");
    println!("  {:<6} {:>12} {:>12} {:>8} {:>12}", "Order", "Entries", "Buckets", "Load", "Bytes");
    for t in model.table_stats() {
        println!(
            "  {:<6} {:>12} {:>12} {:>8.3} {:>12}",
            t.order, t.entries, t.buckets, t.load_factor, t.memory_bytes
        );
    }
    Ok(())
}

fn bench_table(spec: &TableBenchSpec) -> Result<(), Box<dyn std::error::Error>> {
    println!("ALICE-LM Probe Table Benchmark");
    println!("==============================");
    println!("Entries:     {}", spec.entries);
    println!("Lookups:     {}", spec.lookups);
    println!("Multiplier:  {}", spec.multiplier);
    println!("Queue Depth: {}", spec.queue_depth);
    println!();
    for result in table_bench::run_all(spec)? {
        println!(
            "{:<7} buckets {:>10}  insert {:>7.2} ns  lookup {:>7.2} ns  hits {}",
            result.mode.name(),
            result.buckets,
            result.insert_ns,
            result.lookup_ns,
            result.hits
        );
    }
    Ok(())
}
