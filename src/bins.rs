use std::ptr::NonNull;

use crate::block::{Block, Link};

/// Number of free list heads.
pub const BIN_COUNT: usize = 128;

/// Size range covered by each bin, in bytes.
pub const BIN_WIDTH: usize = 1024;

/// Returns the bin that holds free blocks of `size` bytes. Bin `i` covers
/// `[i * BIN_WIDTH, (i + 1) * BIN_WIDTH)`, except for the last one which also
/// takes everything bigger, so blocks grown by coalescing past the mapping
/// threshold still have a home.
#[inline]
pub fn bin_index(size: usize) -> usize {
  (size / BIN_WIDTH).min(BIN_COUNT - 1)
}

/// Segregated free lists. Free program break blocks are indexed by size so
/// that allocation doesn't have to walk the whole heap:
///
/// ```text
///   bins[0]   ──▶ [ 40 ] ⇄ [ 512 ] ⇄ [ 8 ]
///   bins[1]   ──▶ [ 1400 ]
///   bins[2]   ──▶ ∅
///   ...
///   bins[127] ──▶ [ 130048 ] ⇄ [ 400000 ]
/// ```
///
/// Blocks are pushed at the head of their bin, so each bin is unsorted. The
/// links are the `next_free` and `prev_free` fields of the header.
pub(crate) struct Bins {
  heads: [Link; BIN_COUNT],
  len: usize,
}

impl Bins {
  pub const fn new() -> Self {
    Self {
      heads: [None; BIN_COUNT],
      len: 0,
    }
  }

  /// Number of blocks across all bins.
  pub fn len(&self) -> usize {
    self.len
  }

  /// Pushes `block` at the head of the bin matching its current size.
  ///
  /// # Safety
  ///
  /// `block` must be a valid free header that is not in any bin.
  pub unsafe fn insert(
    &mut self,
    mut block: NonNull<Block>,
  ) {
    unsafe {
      let index = bin_index(block.as_ref().size);

      block.as_mut().prev_free = None;
      block.as_mut().next_free = self.heads[index];

      if let Some(mut head) = self.heads[index] {
        head.as_mut().prev_free = Some(block);
      }

      self.heads[index] = Some(block);
      self.len += 1;
    }
  }

  /// Unlinks `block` from its bin.
  ///
  /// # Safety
  ///
  /// `block` must currently be in a bin, and its size must not have changed
  /// since it was inserted.
  pub unsafe fn remove(
    &mut self,
    mut block: NonNull<Block>,
  ) {
    unsafe {
      let prev = block.as_ref().prev_free;
      let next = block.as_ref().next_free;

      match prev {
        Some(mut prev) => prev.as_mut().next_free = next,
        None => self.heads[bin_index(block.as_ref().size)] = next,
      }

      if let Some(mut next) = next {
        next.as_mut().prev_free = prev;
      }

      block.as_mut().next_free = None;
      block.as_mut().prev_free = None;
      self.len -= 1;
    }
  }

  /// Scans the bins from the one matching `size` upwards and returns the first
  /// block that can hold `size` bytes. Taking the first fit of the smallest
  /// eligible bin gets close to best fit without keeping bins sorted.
  pub fn find_fit(
    &self,
    size: usize,
  ) -> Link {
    for head in &self.heads[bin_index(size)..] {
      let mut current = *head;

      while let Some(block) = current {
        // Blocks in bins are valid free headers.
        let block = unsafe { block.as_ref() };
        if block.size >= size {
          return current;
        }
        current = block.next_free;
      }
    }

    None
  }

  /// Iterates over every binned block together with the index of the bin it
  /// was found in.
  pub fn iter(&self) -> impl Iterator<Item = (usize, &Block)> + '_ {
    self.heads.iter().enumerate().flat_map(|(index, head)| {
      let mut current = *head;
      std::iter::from_fn(move || {
        let block = unsafe { current?.as_ref() };
        current = block.next_free;
        Some((index, block))
      })
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::{Backing, HEADER_SIZE};

  fn free_block(
    memory: &mut Vec<u64>,
    size: usize,
  ) -> NonNull<Block> {
    let words = (HEADER_SIZE + size) / 8;
    let start = memory.len();
    memory.resize(start + words, 0);

    unsafe {
      let at = NonNull::new(memory.as_mut_ptr().add(start).cast::<u8>()).unwrap();
      let mut block = Block::write(at, size, Backing::Break);
      block.as_mut().is_free = true;
      block
    }
  }

  #[test]
  fn test_bin_index() {
    assert_eq!(bin_index(0), 0);
    assert_eq!(bin_index(1016), 0);
    assert_eq!(bin_index(1024), 1);
    assert_eq!(bin_index(127 * 1024), 127);
    assert_eq!(bin_index(128 * 1024), 127);
    assert_eq!(bin_index(usize::MAX), 127);
  }

  #[test]
  fn test_insert_find_remove() {
    // Reserve up front so pushing blocks never moves earlier ones.
    let mut memory = Vec::with_capacity(4096);
    let small = free_block(&mut memory, 64);
    let medium = free_block(&mut memory, 1504);
    let large = free_block(&mut memory, 3000);
    let mut bins = Bins::new();

    unsafe {
      bins.insert(small);
      bins.insert(medium);
      bins.insert(large);
    }
    assert_eq!(bins.len(), 3);

    assert_eq!(bins.find_fit(8), Some(small));
    assert_eq!(bins.find_fit(100), Some(medium));
    assert_eq!(bins.find_fit(1600), Some(large));
    assert_eq!(bins.find_fit(4000), None);

    unsafe { bins.remove(medium) };
    assert_eq!(bins.find_fit(100), Some(large));
    assert_eq!(bins.len(), 2);
  }

  #[test]
  fn test_same_bin_is_lifo() {
    let mut memory = Vec::with_capacity(1024);
    let first = free_block(&mut memory, 16);
    let second = free_block(&mut memory, 32);
    let mut bins = Bins::new();

    unsafe {
      bins.insert(first);
      bins.insert(second);
    }

    assert_eq!(bins.find_fit(8), Some(second));
    assert_eq!(bins.find_fit(24), Some(second));

    unsafe { bins.remove(second) };
    assert_eq!(bins.find_fit(8), Some(first));

    let indexes: Vec<usize> = bins.iter().map(|(index, _)| index).collect();
    assert_eq!(indexes, vec![0]);
  }
}
