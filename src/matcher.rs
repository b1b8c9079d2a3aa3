//! Matcher stage: count index hits over every canonical window of a record's
//! sequence field and forward records that satisfy the match predicate.

use std::ops::AddAssign;

use tracing::{debug, info};

use crate::encode::CanonicalWindows;
use crate::error::{KmerError, Result};
use crate::index::KmerIndex;
use crate::io::InputReader;
use crate::pipeline::{BatchProcessor, BatchSink, Emitter, Pipeline, PipelineConfig, Record};

/// Match predicate and record layout.
#[derive(Clone, Debug)]
pub struct MatchConfig {
    k: Option<usize>,
    min_matches: u64,
    invert: bool,
    field: usize,
    annotate: bool,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            k: None,
            min_matches: 1,
            invert: false,
            field: 0,
            annotate: false,
        }
    }
}

impl MatchConfig {
    /// Window length the caller expects; checked against the index. When unset
    /// the index's k is used.
    pub fn k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }
    /// Hits required for a record to pass (default 1).
    pub fn min_matches(mut self, n: u64) -> Self {
        self.min_matches = n;
        self
    }
    /// Negate the threshold test.
    pub fn invert(mut self, yes: bool) -> Self {
        self.invert = yes;
        self
    }
    /// 0-based whitespace-delimited field holding the sequence.
    pub fn field(mut self, n: usize) -> Self {
        self.field = n;
        self
    }
    /// Append `\t<hits>` to forwarded records.
    pub fn annotate(mut self, yes: bool) -> Self {
        self.annotate = yes;
        self
    }

    /// `(hits >= min_matches) != invert`
    #[inline]
    pub fn passes(&self, hits: u64) -> bool {
        (hits >= self.min_matches) != self.invert
    }

    /// Fail with `KMismatch` if a configured k differs from the index's.
    pub fn check_k(&self, index: &KmerIndex) -> Result<()> {
        match self.k {
            Some(requested) if requested != index.k() => Err(KmerError::KMismatch {
                requested,
                index: index.k(),
            }),
            _ => Ok(()),
        }
    }
}

/// Decision for one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchResult {
    pub passed: bool,
    pub hits: u64,
    /// Valid windows examined.
    pub windows: u64,
    /// Windows skipped for symbols outside the alphabet.
    pub invalid_windows: u64,
}

/// Read-only view of a populated index plus the predicate.
pub struct Matcher<'a> {
    index: &'a KmerIndex,
    cfg: &'a MatchConfig,
}

impl<'a> Matcher<'a> {
    pub fn new(index: &'a KmerIndex, cfg: &'a MatchConfig) -> Self {
        Matcher { index, cfg }
    }

    /// Evaluate a bare sequence. Sequences shorter than k have no windows.
    pub fn evaluate_sequence(&self, seq: &[u8]) -> MatchResult {
        let mut hits = 0u64;
        let mut windows = 0u64;
        let mut invalid_windows = 0u64;
        for key in CanonicalWindows::new(seq, self.index.k(), self.index.codec()) {
            match key {
                Some(key) => {
                    windows += 1;
                    if self.index.contains(&key) {
                        hits += 1;
                    }
                }
                None => invalid_windows += 1,
            }
        }
        MatchResult {
            passed: self.cfg.passes(hits),
            hits,
            windows,
            invalid_windows,
        }
    }

    /// Evaluate a record by its configured sequence field.
    pub fn evaluate(&self, record: &str) -> Result<MatchResult> {
        let seq = record
            .split_whitespace()
            .nth(self.cfg.field)
            .ok_or_else(|| KmerError::malformed(format!("no field {} in record", self.cfg.field)))?;
        Ok(self.evaluate_sequence(seq.as_bytes()))
    }
}

/// Matching counters, summed across workers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatchStats {
    pub records: u64,
    pub passed: u64,
    pub failed: u64,
    pub malformed: u64,
    pub windows: u64,
    pub invalid_windows: u64,
    pub hits: u64,
}

impl AddAssign for MatchStats {
    fn add_assign(&mut self, o: Self) {
        self.records += o.records;
        self.passed += o.passed;
        self.failed += o.failed;
        self.malformed += o.malformed;
        self.windows += o.windows;
        self.invalid_windows += o.invalid_windows;
        self.hits += o.hits;
    }
}

/// Pipeline worker forwarding passing records downstream.
pub struct MatchWorker<'a> {
    matcher: Matcher<'a>,
    stats: MatchStats,
}

impl<'a> MatchWorker<'a> {
    pub fn new(index: &'a KmerIndex, cfg: &'a MatchConfig) -> Self {
        MatchWorker {
            matcher: Matcher::new(index, cfg),
            stats: MatchStats::default(),
        }
    }
}

impl BatchProcessor for MatchWorker<'_> {
    type Input = Record;
    type Output = Record;
    type Summary = MatchStats;

    fn process(&mut self, batch: Vec<Record>, out: &mut Emitter<'_, Record>) -> Result<()> {
        for record in batch {
            self.stats.records += 1;
            let result = match self.matcher.evaluate(&record) {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "dropping record");
                    self.stats.malformed += 1;
                    continue;
                }
            };
            self.stats.windows += result.windows;
            self.stats.invalid_windows += result.invalid_windows;
            self.stats.hits += result.hits;
            if !result.passed {
                self.stats.failed += 1;
                continue;
            }
            self.stats.passed += 1;
            if self.matcher.cfg.annotate {
                out.emit(format!("{record}\t{}", result.hits))?;
            } else {
                out.emit(record)?;
            }
        }
        Ok(())
    }

    fn finish(self) -> MatchStats {
        self.stats
    }
}

/// Stream `reader` through matcher workers into `sink`.
///
/// Output order across batches is only preserved with a single worker thread.
pub fn run_matching<S>(
    index: &KmerIndex,
    reader: InputReader,
    cfg: &MatchConfig,
    pipeline: &PipelineConfig,
    sink: S,
) -> Result<(MatchStats, S::Summary)>
where
    S: BatchSink<Item = Record> + Send,
    S::Summary: Send,
{
    cfg.check_k(index)?;
    let report = Pipeline::new("match", pipeline.clone()).run_with_sink(
        reader,
        |_| MatchWorker::new(index, cfg),
        sink,
    )?;
    let mut total = MatchStats::default();
    for s in report.workers {
        total += s;
    }
    info!(
        records = total.records,
        passed = total.passed,
        failed = total.failed,
        malformed = total.malformed,
        "matching finished"
    );
    let summary = report.sink.ok_or_else(|| {
        KmerError::Io(std::io::Error::other("match pipeline finished without a writer"))
    })?;
    Ok((total, summary))
}
