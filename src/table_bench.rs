//! Probe-table microbenchmark
//!
//! Random keys are inserted into a power-of-two table, then looked up
//! through a FIFO: each query is located and prefetched on enqueue and
//! completed `queue_depth` queries later.

use crate::config::BucketMode;
use crate::probe_table::{BucketCursor, ProbeEntry, ProbeTable};
use crate::{ALICELMError, Result};
use bytemuck::{Pod, Zeroable};
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BenchEntry {
    key: u64,
    value: u64,
}

impl ProbeEntry for BenchEntry {
    #[inline(always)]
    fn key(&self) -> u64 {
        self.key
    }
}

/// Benchmark parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TableBenchSpec {
    pub entries: usize,
    pub lookups: usize,
    pub multiplier: f32,
    /// Queries in flight between locate and complete
    pub queue_depth: usize,
    /// Fraction of lookups drawn from inserted keys
    pub hit_ratio: f64,
    pub seed: u64,
}

impl Default for TableBenchSpec {
    fn default() -> Self {
        Self {
            entries: 1 << 20,
            lookups: 1 << 22,
            multiplier: 1.5,
            queue_depth: 8,
            hit_ratio: 0.5,
            seed: 42,
        }
    }
}

/// Timings for one bucket mode
#[derive(Debug, Clone, Serialize)]
pub struct TableBenchResult {
    pub mode: BucketMode,
    pub buckets: usize,
    pub entries: usize,
    pub insert_ns: f64,
    pub lookup_ns: f64,
    pub hits: usize,
    /// Sum of found values; keeps the lookups observable
    pub checksum: u64,
}

/// Run the benchmark for one bucket mode.
pub fn run(spec: &TableBenchSpec, mode: BucketMode) -> Result<TableBenchResult> {
    if spec.queue_depth == 0 || spec.entries == 0 {
        return Err(ALICELMError::InvalidConfig(
            "entries and queue_depth must be positive".to_string(),
        ));
    }
    let buckets = ProbeTable::<BenchEntry>::buckets_for(spec.entries, spec.multiplier).next_power_of_two();
    let mut table = ProbeTable::<BenchEntry>::with_buckets(buckets, mode)?;

    let mut rng = StdRng::seed_from_u64(spec.seed);
    let keys: Vec<u64> = (0..spec.entries)
        .map(|_| rng.random_range(1..=u64::MAX))
        .collect();
    let queries: Vec<u64> = (0..spec.lookups)
        .map(|_| {
            if rng.random_bool(spec.hit_ratio) {
                keys[rng.random_range(0..keys.len())]
            } else {
                rng.random::<u64>() | 1
            }
        })
        .collect();

    let start = Instant::now();
    for (i, &key) in keys.iter().enumerate() {
        match table.insert(BenchEntry { key, value: i as u64 }) {
            Ok(()) | Err(ALICELMError::DuplicateKey(_)) => {}
            Err(e) => return Err(e),
        }
    }
    let insert_ns = start.elapsed().as_nanos() as f64 / spec.entries as f64;

    let mut hits = 0;
    let mut checksum = 0u64;
    let mut queue: VecDeque<(u64, BucketCursor)> = VecDeque::with_capacity(spec.queue_depth);
    let start = Instant::now();
    for &key in &queries {
        if queue.len() == spec.queue_depth {
            if let Some((k, cursor)) = queue.pop_front() {
                if let Some(e) = table.complete_find(k, cursor) {
                    hits += 1;
                    checksum = checksum.wrapping_add(e.value);
                }
            }
        }
        let cursor = table.locate_bucket(key);
        table.prefetch(cursor);
        queue.push_back((key, cursor));
    }
    while let Some((k, cursor)) = queue.pop_front() {
        if let Some(e) = table.complete_find(k, cursor) {
            hits += 1;
            checksum = checksum.wrapping_add(e.value);
        }
    }
    let lookup_ns = if spec.lookups > 0 {
        start.elapsed().as_nanos() as f64 / spec.lookups as f64
    } else {
        0.0
    };

    debug!(
        "{} table: {} entries, {} buckets, {} hits",
        mode.name(),
        table.len(),
        buckets,
        hits
    );
    Ok(TableBenchResult {
        mode,
        buckets,
        entries: table.len(),
        insert_ns,
        lookup_ns,
        hits,
        checksum,
    })
}

/// Run both bucket modes with identical keys.
pub fn run_all(spec: &TableBenchSpec) -> Result<Vec<TableBenchResult>> {
    [BucketMode::Divide, BucketMode::Mask]
        .iter()
        .map(|&mode| run(spec, mode))
        .collect()
}
