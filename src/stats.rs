use crate::{
  block::{Block, HEADER_SIZE},
  heap::Heap,
  source::MemorySource,
};

/// Snapshot of the reporting queries of a [`Heap`]. Block counts and byte
/// totals cover both the program break and the mapped blocks; byte totals are
/// usable sizes, headers are accounted separately in `metadata_bytes`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub metadata_bytes: usize,
  pub header_size: usize,
}

impl HeapStats {
  /// Blocks currently owned by callers.
  pub fn in_use_blocks(&self) -> usize {
    self.allocated_blocks - self.free_blocks
  }

  /// Bytes currently owned by callers.
  pub fn in_use_bytes(&self) -> usize {
    self.allocated_bytes - self.free_bytes
  }
}

impl<S: MemorySource> Heap<S> {
  fn all_blocks(&self) -> impl Iterator<Item = &Block> + '_ {
    self.break_blocks().chain(self.mapped_blocks())
  }

  /// Number of free blocks. Mapped blocks are never free.
  pub fn free_blocks(&self) -> usize {
    self.all_blocks().filter(|block| block.is_free).count()
  }

  pub fn free_bytes(&self) -> usize {
    self
      .all_blocks()
      .filter(|block| block.is_free)
      .map(|block| block.size)
      .sum()
  }

  /// Number of blocks, free or not.
  pub fn allocated_blocks(&self) -> usize {
    self.all_blocks().count()
  }

  pub fn allocated_bytes(&self) -> usize {
    self.all_blocks().map(|block| block.size).sum()
  }

  /// Bytes spent on headers.
  pub fn metadata_bytes(&self) -> usize {
    self.allocated_blocks() * HEADER_SIZE
  }

  pub fn header_size(&self) -> usize {
    HEADER_SIZE
  }

  /// All reporting queries in one pass.
  pub fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      header_size: HEADER_SIZE,
      ..HeapStats::default()
    };

    for block in self.all_blocks() {
      stats.allocated_blocks += 1;
      stats.allocated_bytes += block.size;

      if block.is_free {
        stats.free_blocks += 1;
        stats.free_bytes += block.size;
      }
    }

    stats.metadata_bytes = stats.allocated_blocks * HEADER_SIZE;
    stats
  }
}
