//! Open-addressing probe table with a two-phase find
//!
//! Fixed-size POD entries keyed by a pre-hashed `u64`, linear probing, no
//! tombstones (the table is filled once at build time and read-only after).
//!
//! ## Two-phase find
//!
//! ```text
//! cursor = table.locate_bucket(key)   // arithmetic only, no payload access
//! table.prefetch(cursor)              // non-blocking cache hint
//!   ... service other lookups while the line is in flight ...
//! table.complete_find(key, cursor)    // scan forward, compare keys
//! ```
//!
//! Splitting the find lets a scheduler overlap the memory latency of one
//! probe with the work of another.
//!
//! Key `0` marks an empty bucket and can never be inserted. At least one
//! bucket always stays empty, so every scan terminates.

use crate::config::{BucketMode, TableConfig};
use crate::fast_div::Divider;
use crate::{ALICELMError, Result};
use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reserved key for empty buckets
pub const EMPTY_KEY: u64 = 0;

/// Fixed-size table record
///
/// `Zeroable::zeroed()` must produce an entry whose key is `EMPTY_KEY`.
pub trait ProbeEntry: Pod {
    fn key(&self) -> u64;
}

/// Position of a key's home bucket, produced by phase one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketCursor(usize);

impl BucketCursor {
    #[inline]
    pub fn bucket(&self) -> usize {
        self.0
    }
}

/// Issue a non-blocking prefetch for the cache line holding `ptr`.
#[inline(always)]
pub fn prefetch<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    #[allow(unused_unsafe)]
    // SAFETY: prefetch is a hint and never faults, whatever the address.
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(ptr as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Reducer {
    Divide(Divider),
    Mask(u64),
}

impl Reducer {
    fn new(buckets: usize, mode: BucketMode) -> Result<Self> {
        match mode {
            BucketMode::Divide => Ok(Self::Divide(Divider::new(buckets as u64))),
            BucketMode::Mask => {
                if !buckets.is_power_of_two() {
                    return Err(ALICELMError::ModelError(format!(
                        "Mask mode needs a power-of-two bucket count, got {}",
                        buckets
                    )));
                }
                Ok(Self::Mask(buckets as u64 - 1))
            }
        }
    }

    #[inline(always)]
    fn reduce(&self, key: u64) -> usize {
        match self {
            Self::Divide(d) => d.remainder(key) as usize,
            Self::Mask(m) => (key & m) as usize,
        }
    }

    fn mode(&self) -> BucketMode {
        match self {
            Self::Divide(_) => BucketMode::Divide,
            Self::Mask(_) => BucketMode::Mask,
        }
    }
}

/// Open-addressing hash table over POD entries
#[derive(Debug, Clone)]
pub struct ProbeTable<E: ProbeEntry> {
    entries: Vec<E>,
    reducer: Reducer,
    len: usize,
}

impl<E: ProbeEntry> ProbeTable<E> {
    /// Bucket count needed to hold `entries` at the given oversizing factor.
    /// Always leaves at least one bucket empty.
    pub fn buckets_for(entries: usize, multiplier: f32) -> usize {
        let scaled = (entries as f64 * multiplier as f64).ceil() as usize;
        scaled.max(entries + 1)
    }

    /// Allocate a table sized for `entries` records.
    pub fn new(entries: usize, config: &TableConfig) -> Result<Self> {
        config.validate()?;
        let mut buckets = Self::buckets_for(entries, config.multiplier);
        if config.bucket_mode == BucketMode::Mask {
            buckets = buckets.next_power_of_two();
        }
        Self::with_buckets(buckets, config.bucket_mode)
    }

    /// Allocate a table with an exact bucket count.
    pub fn with_buckets(buckets: usize, mode: BucketMode) -> Result<Self> {
        if buckets == 0 {
            return Err(ALICELMError::ModelError(
                "Probe table needs at least one bucket".to_string(),
            ));
        }
        Ok(Self {
            entries: vec![E::zeroed(); buckets],
            reducer: Reducer::new(buckets, mode)?,
            len: 0,
        })
    }

    /// Home bucket of `key`
    #[inline(always)]
    pub fn ideal(&self, key: u64) -> usize {
        self.reducer.reduce(key)
    }

    /// Phase one: compute the home bucket without touching entry memory.
    #[inline(always)]
    pub fn locate_bucket(&self, key: u64) -> BucketCursor {
        BucketCursor(self.ideal(key))
    }

    /// Hint the cache to load the bucket behind `cursor`.
    #[inline(always)]
    pub fn prefetch(&self, cursor: BucketCursor) {
        if let Some(entry) = self.entries.get(cursor.0) {
            prefetch(entry as *const E);
        }
    }

    /// Phase two: scan forward from `cursor` until `key` or an empty bucket.
    #[inline]
    pub fn complete_find(&self, key: u64, cursor: BucketCursor) -> Option<&E> {
        if key == EMPTY_KEY {
            return None;
        }
        let buckets = self.entries.len();
        let mut i = cursor.0;
        if i >= buckets {
            return None;
        }
        for _ in 0..buckets {
            let entry = &self.entries[i];
            let found = entry.key();
            if found == key {
                return Some(entry);
            }
            if found == EMPTY_KEY {
                return None;
            }
            i += 1;
            if i == buckets {
                i = 0;
            }
        }
        None
    }

    /// Both phases back to back.
    #[inline]
    pub fn find(&self, key: u64) -> Option<&E> {
        self.complete_find(key, self.locate_bucket(key))
    }

    /// Insert a record. Build time only.
    pub fn insert(&mut self, entry: E) -> Result<()> {
        let key = entry.key();
        if key == EMPTY_KEY {
            return Err(ALICELMError::ReservedKey);
        }
        let buckets = self.entries.len();
        if self.len + 1 >= buckets {
            return Err(ALICELMError::CapacityExceeded { buckets });
        }
        let mut i = self.ideal(key);
        loop {
            let found = self.entries[i].key();
            if found == EMPTY_KEY {
                self.entries[i] = entry;
                self.len += 1;
                return Ok(());
            }
            if found == key {
                return Err(ALICELMError::DuplicateKey(key));
            }
            i += 1;
            if i == buckets {
                i = 0;
            }
        }
    }

    /// Number of forward steps from the home bucket to `key`.
    pub fn probe_distance(&self, key: u64) -> Option<usize> {
        let entry = self.find(key)? as *const E;
        let slot = self.entries.iter().position(|e| std::ptr::eq(e, entry))?;
        let ideal = self.ideal(key);
        Some((slot + self.entries.len() - ideal) % self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn buckets(&self) -> usize {
        self.entries.len()
    }

    pub fn bucket_mode(&self) -> BucketMode {
        self.reducer.mode()
    }

    pub fn load_factor(&self) -> f64 {
        self.len as f64 / self.entries.len() as f64
    }

    pub fn memory_bytes(&self) -> usize {
        self.entries.len() * std::mem::size_of::<E>()
    }

    /// Occupied entries in bucket order
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.entries.iter().filter(|e| e.key() != EMPTY_KEY)
    }
}

// Serialized form: bucket mode plus the raw bucket array. The reducer is
// rebuilt on load so its reciprocal never goes stale.

#[derive(Serialize)]
struct RawTableRef<'a, E> {
    mode: BucketMode,
    entries: &'a [E],
}

#[derive(Deserialize)]
struct RawTable<E> {
    mode: BucketMode,
    entries: Vec<E>,
}

impl<E: ProbeEntry + Serialize> Serialize for ProbeTable<E> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        RawTableRef {
            mode: self.bucket_mode(),
            entries: &self.entries,
        }
        .serialize(serializer)
    }
}

impl<'de, E: ProbeEntry + Deserialize<'de>> Deserialize<'de> for ProbeTable<E> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = RawTable::<E>::deserialize(deserializer)?;
        if raw.entries.is_empty() {
            return Err(serde::de::Error::custom("probe table without buckets"));
        }
        let reducer =
            Reducer::new(raw.entries.len(), raw.mode).map_err(serde::de::Error::custom)?;
        let len = raw.entries.iter().filter(|e| e.key() != EMPTY_KEY).count();
        if len >= raw.entries.len() {
            return Err(serde::de::Error::custom("probe table has no empty bucket"));
        }
        Ok(Self {
            entries: raw.entries,
            reducer,
            len,
        })
    }
}
