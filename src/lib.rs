//! Strand-canonical k-mer indexing and matching over streaming text records.
//!
//! - [`encode`]: 2-bit / byte key backends with reverse-complement canonicalization
//! - [`KmerIndex`]: concurrently populated, prefix-sharded ordered k-mer set
//! - [`pipeline`]: bounded-queue producer / worker / sink scaffold with a Stop relay
//! - [`build_index`] and [`run_matching`]: the population and matching stages
//!
//! Typical flow: populate an index from a k-mer table, then stream records through
//! matcher workers into a [`RecordWriter`]. The index is read-only once
//! [`build_index`] returns.

mod builder;
pub mod encode;
mod error;
mod index;
pub mod io;
mod matcher;
pub mod pipeline;
mod writer;

pub use builder::{BuildConfig, PopulateStats, PopulateWorker, build_index, populate};
pub use encode::{
    ByteCodec, CanonicalWindows, Codec, EncodedKey, KmerCodec, MAX_K, PackedCodec, canonicalize,
    revcomp,
};
pub use error::{KmerError, Result, Stage};
pub use index::{IndexConfig, KmerIndex};
pub use io::{InputSource, OutputTarget};
pub use matcher::{MatchConfig, MatchResult, MatchStats, MatchWorker, Matcher, run_matching};
pub use pipeline::{Pipeline, PipelineConfig};
pub use writer::{RecordWriter, WriteStats};
