use std::io;

use thiserror::Error;

/// Everything that can make a heap operation fail. Every failing operation
/// leaves the heap exactly as it was before the call.
#[derive(Debug, Error)]
pub enum HeapError {
  /// Zero sized request, or bigger than the configured ceiling once aligned.
  #[error("invalid allocation size: {requested} bytes")]
  InvalidSize { requested: usize },

  /// `count * size` doesn't fit in a `usize`.
  #[error("allocation size overflows: {count} elements of {size} bytes")]
  Overflow { count: usize, size: usize },

  /// The program break couldn't be moved.
  #[error("program break extension by {increment} bytes refused: {source}")]
  BreakExhausted {
    increment: usize,
    #[source]
    source: io::Error,
  },

  /// The anonymous mapping couldn't be created.
  #[error("anonymous mapping of {length} bytes failed: {source}")]
  MapFailed {
    length: usize,
    #[source]
    source: io::Error,
  },

  /// The kernel refused to unmap a region.
  #[error("unmapping {length} bytes failed: {source}")]
  UnmapFailed {
    length: usize,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Config(#[from] ConfigError),

  /// Reported by [`crate::Heap::check_invariants`].
  #[error("heap corrupted: {reason}")]
  Corrupted { reason: String },
}

/// Rejected [`crate::HeapConfig`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
  #[error("mmap threshold {threshold} needs {needed} bins, only {available} exist")]
  ThresholdOutOfBinRange {
    threshold: usize,
    needed: usize,
    available: usize,
  },

  #[error("mmap threshold must be a non-zero multiple of 8, got {0}")]
  UnalignedThreshold(usize),

  #[error("request ceiling must be a non-zero multiple of 8, got {0}")]
  UnalignedCeiling(usize),

  #[error("minimum split remainder must be a non-zero multiple of 8, got {0}")]
  UnalignedSplit(usize),
}
