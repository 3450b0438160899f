use std::{mem, ptr::NonNull};

/// Nullable link between block headers. Used both for the address ordered
/// block lists and for the bin free lists.
pub(crate) type Link = Option<NonNull<Block>>;

/// Header size in bytes, rounded up to [`crate::align::ALIGNMENT`] so that
/// the usable address of every block stays aligned.
pub const HEADER_SIZE: usize = crate::align!(mem::size_of::<Block>());

/// Where the memory of a block came from. Release and resize dispatch on this
/// tag rather than on the block size, since merged break blocks can grow past
/// the mapping threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
  /// Obtained by moving the program break.
  Break,
  /// Obtained from an anonymous mapping of its own.
  Mapped,
}

/// Metadata header written in place right before the usable region of every
/// block:
///
/// ```text
///   ┌───────────────────────┬────────────────────────────────┐
///   │    Block Header       │         User Data              │
///   │  ┌─────────────────┐  │                                │
///   │  │ size: N         │  │  ┌──────────────────────────┐  │
///   │  │ is_free         │  │  │                          │  │
///   │  │ backing         │  │  │     N bytes usable       │  │
///   │  │ address ────────┼──┼─▶│                          │  │
///   │  │ next / prev     │  │  │                          │  │
///   │  │ free links      │  │  └──────────────────────────┘  │
///   │  └─────────────────┘  │                                │
///   │    HEADER_SIZE bytes  │                                │
///   └───────────────────────┴────────────────────────────────┘
/// ```
///
/// `next_free` and `prev_free` are only meaningful while the block sits in a
/// bin, see [`crate::bins::Bins`].
#[repr(C)]
pub struct Block {
  pub size: usize,
  pub is_free: bool,
  pub backing: Backing,
  pub address: *mut u8,
  pub next: Link,
  pub prev: Link,
  pub next_free: Link,
  pub prev_free: Link,
}

impl Block {
  /// Writes a fresh, allocated, unlinked header at `at` and returns it.
  ///
  /// # Safety
  ///
  /// `at` must be aligned to [`crate::align::ALIGNMENT`] and valid for writes
  /// of `HEADER_SIZE + size` bytes.
  pub unsafe fn write(
    at: NonNull<u8>,
    size: usize,
    backing: Backing,
  ) -> NonNull<Block> {
    unsafe {
      let block = at.cast::<Block>();
      block.as_ptr().write(Block {
        size,
        is_free: false,
        backing,
        address: at.as_ptr().add(HEADER_SIZE),
        next: None,
        prev: None,
        next_free: None,
        prev_free: None,
      });

      block
    }
  }

  /// Returns the header that owns the usable `address`.
  ///
  /// # Safety
  ///
  /// `address` must have been returned by this crate for a block that is
  /// still alive. Anything else is undefined behaviour.
  #[inline]
  pub unsafe fn from_address(address: NonNull<u8>) -> NonNull<Block> {
    unsafe { NonNull::new_unchecked(address.as_ptr().sub(HEADER_SIZE)).cast() }
  }

  /// Usable address handed to the caller.
  #[inline]
  pub fn usable(&self) -> NonNull<u8> {
    // Headers are only created by `Block::write`, which never stores null.
    unsafe { NonNull::new_unchecked(self.address) }
  }

  /// First address past the usable region.
  #[inline]
  pub fn end(&self) -> *mut u8 {
    self.address.wrapping_add(self.size)
  }

  /// Size including the header.
  #[inline]
  pub fn total_size(&self) -> usize {
    HEADER_SIZE + self.size
  }
}

/// Whether `right` starts exactly where `left` ends. List neighbours are not
/// necessarily contiguous when something else moved the program break in
/// between, and only contiguous blocks may be merged.
///
/// # Safety
///
/// `left` must point to a valid header.
#[inline]
pub(crate) unsafe fn adjacent(
  left: NonNull<Block>,
  right: NonNull<Block>,
) -> bool {
  unsafe { left.as_ref().end() == right.as_ptr().cast::<u8>() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::align::ALIGNMENT;

  #[test]
  fn test_header_size_is_aligned() {
    assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
    assert!(HEADER_SIZE >= mem::size_of::<Block>());
  }

  #[test]
  fn test_write_and_resolve() {
    let mut memory = vec![0u64; 64];
    let at = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap();

    unsafe {
      let block = Block::write(at, 128, Backing::Break);

      assert_eq!(block.as_ptr().cast::<u8>(), at.as_ptr());
      assert_eq!(block.as_ref().size, 128);
      assert!(!block.as_ref().is_free);
      assert_eq!(block.as_ref().backing, Backing::Break);
      assert_eq!(block.as_ref().usable().as_ptr(), at.as_ptr().add(HEADER_SIZE));
      assert_eq!(block.as_ref().total_size(), HEADER_SIZE + 128);

      let resolved = Block::from_address(block.as_ref().usable());
      assert_eq!(resolved, block);
    }
  }

  #[test]
  fn test_adjacency() {
    let mut memory = vec![0u64; 64];
    let at = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap();

    unsafe {
      let left = Block::write(at, 16, Backing::Break);
      let right = Block::write(
        NonNull::new_unchecked(left.as_ref().end()),
        16,
        Backing::Break,
      );
      let far = Block::write(
        NonNull::new_unchecked(right.as_ref().end().add(ALIGNMENT)),
        16,
        Backing::Break,
      );

      assert!(adjacent(left, right));
      assert!(!adjacent(right, left));
      assert!(!adjacent(right, far));
    }
  }
}
