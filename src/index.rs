//! KmerIndex: concurrent ordered set of canonical k-mer keys with per-key counts.
//!
//! Keys are bucketed by their leading bases into shards, each a `BTreeMap` behind
//! its own `RwLock`. Because a shard id is the key's prefix, visiting shards in id
//! order and each shard in key order yields the whole index in sorted order.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rayon::prelude::*;
use tracing::debug;

use crate::encode::{Codec, EncodedKey, KmerCodec, validate_k};
use crate::error::{KmerError, Result};
use crate::io::OutputTarget;

/// Shard geometry and memory cap.
#[derive(Clone, Debug)]
pub struct IndexConfig {
    prefix_bases: usize,
    max_keys: Option<usize>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            prefix_bases: 4,
            max_keys: None,
        }
    }
}

impl IndexConfig {
    /// Number of leading bases used to pick a shard (4^n shards, n clamped to 1..=8).
    pub fn prefix_bases(mut self, n: usize) -> Self {
        self.prefix_bases = n.clamp(1, 8);
        self
    }
    /// Maximum number of distinct keys; inserting beyond it fails with `IndexFull`.
    pub fn max_keys(mut self, n: usize) -> Self {
        self.max_keys = Some(n);
        self
    }
}

type Shard = RwLock<BTreeMap<EncodedKey, u64>>;

/// Thread-safe sorted k-mer set. All methods take `&self` except pruning.
pub struct KmerIndex {
    k: usize,
    codec: Codec,
    prefix_bases: usize,
    max_keys: Option<usize>,
    len: AtomicUsize,
    shards: Vec<Shard>,
}

impl KmerIndex {
    /// Create an empty index with default geometry.
    pub fn new(k: usize, codec: Codec) -> Result<Self> {
        Self::with_config(k, codec, IndexConfig::default())
    }

    /// Create an empty index with explicit geometry.
    pub fn with_config(k: usize, codec: Codec, cfg: IndexConfig) -> Result<Self> {
        validate_k(k)?;
        let prefix_bases = cfg.prefix_bases.min(k);
        let n_shards = 1usize << (2 * prefix_bases);
        Ok(KmerIndex {
            k,
            codec,
            prefix_bases,
            max_keys: cfg.max_keys,
            len: AtomicUsize::new(0),
            shards: (0..n_shards).map(|_| RwLock::new(BTreeMap::new())).collect(),
        })
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    #[inline]
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Number of distinct keys.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: &EncodedKey) -> &Shard {
        &self.shards[key.prefix_code(self.prefix_bases)]
    }

    /// Reserve one slot against `max_keys`. Called with the shard write lock held.
    fn reserve_slot(&self) -> Result<()> {
        match self.max_keys {
            None => {
                self.len.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            Some(limit) => self
                .len
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < limit).then_some(n + 1)
                })
                .map(|_| ())
                .map_err(|_| KmerError::IndexFull { limit }),
        }
    }

    /// Insert a key with count 0. Returns `true` if it was not present.
    ///
    /// Concurrent inserts of the same key yield exactly one entry.
    pub fn insert(&self, key: EncodedKey) -> Result<bool> {
        let mut shard = self.shard(&key).write();
        if shard.contains_key(&key) {
            return Ok(false);
        }
        self.reserve_slot()?;
        shard.insert(key, 0);
        Ok(true)
    }

    /// Membership test; safe alongside concurrent inserts.
    pub fn contains(&self, key: &EncodedKey) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Add `delta` to a key's count, inserting it when absent. Returns the new count.
    pub fn increment(&self, key: EncodedKey, delta: u64) -> Result<u64> {
        let mut shard = self.shard(&key).write();
        if let Some(c) = shard.get_mut(&key) {
            *c = c.saturating_add(delta);
            return Ok(*c);
        }
        self.reserve_slot()?;
        shard.insert(key, delta);
        Ok(delta)
    }

    /// Count of a key, `None` when absent.
    pub fn count(&self, key: &EncodedKey) -> Option<u64> {
        self.shard(key).read().get(key).copied()
    }

    /// Canonicalize, encode and insert a k-mer given as text.
    pub fn insert_str(&self, kmer: &str) -> Result<bool> {
        self.insert(self.key_for(kmer)?)
    }

    /// Canonicalize, encode and look up a k-mer given as text.
    pub fn contains_str(&self, kmer: &str) -> bool {
        self.key_for(kmer).is_ok_and(|key| self.contains(&key))
    }

    fn key_for(&self, kmer: &str) -> Result<EncodedKey> {
        if kmer.len() != self.k {
            return Err(KmerError::malformed(format!(
                "k-mer {kmer:?} has length {}, index k is {}",
                kmer.len(),
                self.k
            )));
        }
        self.codec.encode_canonical(kmer.as_bytes())
    }

    /// Visit every entry in ascending key order.
    pub fn for_each_sorted<F>(&self, mut f: F)
    where
        F: FnMut(&EncodedKey, u64),
    {
        for shard in &self.shards {
            for (key, &count) in shard.read().iter() {
                f(key, count);
            }
        }
    }

    /// Write every entry as `KMER\tCOUNT` in ascending key order. Returns lines written.
    pub fn dump<W: Write>(&self, mut w: W) -> Result<u64> {
        let mut lines = 0u64;
        for shard in &self.shards {
            for (key, count) in shard.read().iter() {
                let text = self.codec.decode(key, self.k)?;
                w.write_all(&text)?;
                writeln!(w, "\t{count}")?;
                lines += 1;
            }
        }
        w.flush()?;
        Ok(lines)
    }

    /// [`dump`](Self::dump) into `target`, gzip-compressed for a `.gz` path.
    /// The stream is closed, so a gzip table can be read back as reference input.
    pub fn dump_to(&self, target: &OutputTarget) -> Result<u64> {
        let mut out = target.open()?;
        let lines = self.dump(&mut out)?;
        out.close()?;
        debug!(output = %target, lines, "k-mer table written");
        Ok(lines)
    }

    /// Drop keys whose count is below `min`. Returns the number removed.
    pub fn retain_min_count(&mut self, min: u64) -> usize {
        let removed: usize = self
            .shards
            .par_iter_mut()
            .map(|shard| {
                let map = shard.get_mut();
                let before = map.len();
                map.retain(|_, c| *c >= min);
                before - map.len()
            })
            .sum();
        self.len.fetch_sub(removed, Ordering::AcqRel);
        debug!(removed, min, remaining = self.len(), "pruned k-mer index");
        removed
    }
}
