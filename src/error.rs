//! Error taxonomy shared by the codec, the index and the pipeline stages.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Role of a pipeline thread, used to name the failing stage in diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Producer thread reading raw records.
    Reader,
    /// Worker thread `n` of a stage.
    Worker(usize),
    /// Sink thread draining the output queue.
    Writer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Reader => write!(f, "reader"),
            Stage::Worker(n) => write!(f, "worker {n}"),
            Stage::Writer => write!(f, "writer"),
        }
    }
}

#[derive(Debug, Error)]
/// Errors returned by kmatch.
pub enum KmerError {
    /// A k-mer or window contains a symbol outside {A,C,G,T}.
    #[error("invalid nucleotide {symbol:?} at position {position}")]
    InvalidAlphabet { symbol: char, position: usize },
    /// k outside the supported range.
    #[error("k-mer length {k} out of range 1..={max}")]
    InvalidLength { k: usize, max: usize },
    /// A record lacks an expected field or has an unparsable one.
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },
    /// Key does not belong to the codec asked to decode it.
    #[error("invalid encoded key: {0}")]
    InvalidKey(String),
    /// The index reached its configured key limit.
    #[error("k-mer index is full ({limit} keys)")]
    IndexFull { limit: usize },
    /// A pipeline thread failed; `stage` names it.
    #[error("{pipeline} {stage} failed: {source}")]
    Stage {
        pipeline: &'static str,
        stage: Stage,
        #[source]
        source: Box<KmerError>,
    },
    /// A pipeline thread panicked.
    #[error("{pipeline} {stage} panicked: {message}")]
    Panicked {
        pipeline: &'static str,
        stage: Stage,
        message: String,
    },
    /// A processor or sink panicked inside a role loop; the loop still drained
    /// and relayed Stop.
    #[error("panic: {0}")]
    Panic(String),
    /// Matcher configured for a different k than the index holds.
    #[error("matcher k={requested} does not match index k={index}")]
    KMismatch { requested: usize, index: usize },
    /// All receivers of a queue are gone.
    #[error("batch queue closed")]
    QueueClosed,
    /// A bounded wait expired.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KmerError {
    /// Record-level errors are recovered by skipping the record or window.
    pub fn is_fatal(&self) -> bool {
        match self {
            KmerError::InvalidAlphabet { .. } | KmerError::MalformedRecord { .. } => false,
            KmerError::Stage { source, .. } => source.is_fatal(),
            _ => true,
        }
    }

    /// Innermost error, unwrapping stage context.
    pub fn root(&self) -> &KmerError {
        match self {
            KmerError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        KmerError::MalformedRecord {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = KmerError> = std::result::Result<T, E>;
