use crate::{
  align::ALIGNMENT,
  bins::{BIN_COUNT, BIN_WIDTH},
  error::ConfigError,
};

/// Requests of at least this many bytes get an anonymous mapping of their own.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

/// A free block is only split when the leftover, after paying for the new
/// header, is at least this big. Smaller leftovers are handed to the caller.
pub const MIN_SPLIT: usize = 128;

/// Largest request accepted, after alignment.
pub const MAX_REQUEST: usize = 100_000_000;

/// Tunables of a [`crate::Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
  /// Aligned requests at or above this size are mapped instead of carved
  /// from the program break.
  pub mmap_threshold: usize,
  /// Minimum leftover capacity for a split to happen.
  pub min_split: usize,
  /// Ceiling for aligned request sizes.
  pub max_request: usize,
}

impl HeapConfig {
  pub const DEFAULT: Self = Self {
    mmap_threshold: MMAP_THRESHOLD,
    min_split: MIN_SPLIT,
    max_request: MAX_REQUEST,
  };

  /// Checks that the values are usable together. Sizes must be non-zero
  /// multiples of [`ALIGNMENT`]. Break blocks are always smaller than
  /// `mmap_threshold` when they are handed out, so the threshold must not
  /// need more than [`BIN_COUNT`] bins of [`BIN_WIDTH`] bytes.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.mmap_threshold == 0 || self.mmap_threshold % ALIGNMENT != 0 {
      return Err(ConfigError::UnalignedThreshold(self.mmap_threshold));
    }

    if self.max_request == 0 || self.max_request % ALIGNMENT != 0 {
      return Err(ConfigError::UnalignedCeiling(self.max_request));
    }

    if self.min_split == 0 || self.min_split % ALIGNMENT != 0 {
      return Err(ConfigError::UnalignedSplit(self.min_split));
    }

    let needed = self.mmap_threshold.div_ceil(BIN_WIDTH);
    if needed > BIN_COUNT {
      return Err(ConfigError::ThresholdOutOfBinRange {
        threshold: self.mmap_threshold,
        needed,
        available: BIN_COUNT,
      });
    }

    Ok(())
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::DEFAULT
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_is_valid() {
    assert_eq!(HeapConfig::default().validate(), Ok(()));
    assert_eq!(MMAP_THRESHOLD / BIN_WIDTH, BIN_COUNT);
  }

  #[test]
  fn test_threshold_past_bins() {
    let config = HeapConfig {
      mmap_threshold: MMAP_THRESHOLD + ALIGNMENT,
      ..HeapConfig::default()
    };

    assert_eq!(
      config.validate(),
      Err(ConfigError::ThresholdOutOfBinRange {
        threshold: MMAP_THRESHOLD + ALIGNMENT,
        needed: BIN_COUNT + 1,
        available: BIN_COUNT,
      })
    );
  }

  #[test]
  fn test_unaligned_values() {
    let threshold = HeapConfig {
      mmap_threshold: 1000 + 1,
      ..HeapConfig::default()
    };
    assert_eq!(threshold.validate(), Err(ConfigError::UnalignedThreshold(1001)));

    let ceiling = HeapConfig {
      max_request: 0,
      ..HeapConfig::default()
    };
    assert_eq!(ceiling.validate(), Err(ConfigError::UnalignedCeiling(0)));
  }

  #[test]
  fn test_split_remainder_must_hold_a_block() {
    let empty = HeapConfig {
      min_split: 0,
      ..HeapConfig::default()
    };
    assert_eq!(empty.validate(), Err(ConfigError::UnalignedSplit(0)));

    let odd = HeapConfig {
      min_split: 20,
      ..HeapConfig::default()
    };
    assert_eq!(odd.validate(), Err(ConfigError::UnalignedSplit(20)));

    let small = HeapConfig {
      min_split: ALIGNMENT,
      ..HeapConfig::default()
    };
    assert_eq!(small.validate(), Ok(()));
  }
}
