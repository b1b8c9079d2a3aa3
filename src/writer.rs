//! Writer stage: serialize record batches to stdout, a file or a gzip file.

use std::io::Write;

use tracing::debug;

use crate::error::Result;
use crate::io::{OutputStream, OutputTarget};
use crate::pipeline::{BatchSink, Record};

/// Totals written by a [`RecordWriter`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub records: u64,
    pub batches: u64,
    pub bytes: u64,
}

/// Newline-delimited record sink, flushed after every batch.
pub struct RecordWriter {
    out: OutputStream,
    stats: WriteStats,
}

impl RecordWriter {
    /// Open `target` for writing.
    pub fn create(target: &OutputTarget) -> Result<Self> {
        debug!(output = %target, "opening output");
        Ok(RecordWriter {
            out: target.open()?,
            stats: WriteStats::default(),
        })
    }

    /// Finish the stream (gzip trailer included) and hand back the totals.
    pub fn close(self) -> Result<WriteStats> {
        self.out.close()?;
        Ok(self.stats)
    }
}

impl BatchSink for RecordWriter {
    type Item = Record;
    type Summary = WriteStats;

    fn write_batch(&mut self, batch: Vec<Record>) -> Result<()> {
        for record in &batch {
            self.out.write_all(record.as_bytes())?;
            self.out.write_all(b"\n")?;
            self.stats.bytes += record.len() as u64 + 1;
        }
        self.out.flush()?;
        self.stats.records += batch.len() as u64;
        self.stats.batches += 1;
        Ok(())
    }

    fn finish(self) -> Result<WriteStats> {
        self.close()
    }
}
