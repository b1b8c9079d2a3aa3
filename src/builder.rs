//! Index population: fan a stream of k-mer records across pipeline workers that
//! insert into one shared [`KmerIndex`].
//!
//! Record grammar: `KMER_OR_SEQUENCE [FREQUENCY]`, whitespace separated. A first
//! field longer than k contributes all of its valid windows. Blank lines and lines
//! starting with `#` are ignored.

use std::ops::AddAssign;

use tracing::{debug, info};

use crate::encode::{CanonicalWindows, Codec, validate_k};
use crate::error::{KmerError, Result};
use crate::index::{IndexConfig, KmerIndex};
use crate::io::InputReader;
use crate::pipeline::{BatchProcessor, Emitter, Pipeline, PipelineConfig, Record};

/// Build-time configuration.
#[derive(Clone, Debug)]
pub struct BuildConfig {
    k: usize,
    codec: Codec,
    index: IndexConfig,
    min_count: u64,
}

impl BuildConfig {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            codec: Codec::default(),
            index: IndexConfig::default(),
            min_count: 0,
        }
    }
    /// Key backend (default: packed).
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }
    /// Shard geometry and key cap.
    pub fn index(mut self, cfg: IndexConfig) -> Self {
        self.index = cfg;
        self
    }
    /// After population, drop k-mers seen fewer than `n` times.
    pub fn min_count(mut self, n: u64) -> Self {
        self.min_count = n;
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }
}

/// Per-worker population counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PopulateStats {
    /// Non-blank, non-comment records seen.
    pub records: u64,
    /// Valid k-mers added (including repeats).
    pub kmers: u64,
    /// Windows skipped for symbols outside the alphabet.
    pub skipped_invalid: u64,
    /// Records whose sequence is shorter than k.
    pub skipped_short: u64,
    /// Records with an unparsable frequency field.
    pub malformed: u64,
}

impl AddAssign for PopulateStats {
    fn add_assign(&mut self, o: Self) {
        self.records += o.records;
        self.kmers += o.kmers;
        self.skipped_invalid += o.skipped_invalid;
        self.skipped_short += o.skipped_short;
        self.malformed += o.malformed;
    }
}

/// Parse the optional frequency column.
fn parse_frequency(field: Option<&str>) -> Result<u64> {
    match field {
        None => Ok(1),
        Some(f) => f
            .parse::<u64>()
            .map_err(|e| KmerError::malformed(format!("frequency {f:?}: {e}"))),
    }
}

/// Worker inserting every valid k-mer of its batches into the shared index.
pub struct PopulateWorker<'a> {
    index: &'a KmerIndex,
    stats: PopulateStats,
}

impl<'a> PopulateWorker<'a> {
    pub fn new(index: &'a KmerIndex) -> Self {
        PopulateWorker {
            index,
            stats: PopulateStats::default(),
        }
    }

    /// Add one record. Index errors are fatal and returned; record-level problems
    /// are counted and skipped.
    pub fn add_record(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        self.stats.records += 1;

        let mut fields = line.split_whitespace();
        let Some(seq) = fields.next() else {
            return Ok(());
        };
        let freq = match parse_frequency(fields.next()) {
            Ok(f) => f,
            Err(e) => {
                debug!(record = line, error = %e, "skipping record");
                self.stats.malformed += 1;
                return Ok(());
            }
        };

        let k = self.index.k();
        if seq.len() < k {
            self.stats.skipped_short += 1;
            return Ok(());
        }
        for key in CanonicalWindows::new(seq.as_bytes(), k, self.index.codec()) {
            match key {
                Some(key) => {
                    self.index.increment(key, freq)?;
                    self.stats.kmers += 1;
                }
                None => self.stats.skipped_invalid += 1,
            }
        }
        Ok(())
    }
}

impl BatchProcessor for PopulateWorker<'_> {
    type Input = Record;
    type Output = ();
    type Summary = PopulateStats;

    fn process(&mut self, batch: Vec<Record>, _out: &mut Emitter<'_, ()>) -> Result<()> {
        batch.iter().try_for_each(|line| self.add_record(line))
    }

    fn finish(self) -> PopulateStats {
        self.stats
    }
}

/// Populate a new index from `reader` using the pipeline's worker pool.
///
/// Returns once every worker has joined; the index is then read-only for matching.
pub fn build_index(
    reader: InputReader,
    cfg: &BuildConfig,
    pipeline: &PipelineConfig,
) -> Result<(KmerIndex, PopulateStats)> {
    validate_k(cfg.k)?;
    let mut index = KmerIndex::with_config(cfg.k, cfg.codec, cfg.index.clone())?;
    let stats = populate(&index, reader, pipeline)?;

    if cfg.min_count > 0 {
        let removed = index.retain_min_count(cfg.min_count);
        info!(removed, min_count = cfg.min_count, "dropped rare k-mers");
    }
    info!(
        k = cfg.k,
        keys = index.len(),
        records = stats.records,
        kmers = stats.kmers,
        malformed = stats.malformed,
        "k-mer index built"
    );
    Ok((index, stats))
}

/// Add the records of `reader` to an existing index.
pub fn populate(
    index: &KmerIndex,
    reader: InputReader,
    pipeline: &PipelineConfig,
) -> Result<PopulateStats> {
    let report = Pipeline::new("populate", pipeline.clone())
        .consume(reader, |_| PopulateWorker::new(index))?;
    let mut total = PopulateStats::default();
    for s in report.workers {
        total += s;
    }
    Ok(total)
}
