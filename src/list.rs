use std::{marker::PhantomData, ptr::NonNull};

use crate::block::{Block, Link};

/// Address ordered, doubly linked list of block headers. The links live in
/// the headers themselves (`next` and `prev`), so the list never allocates
/// anything. One list tracks program break blocks, where the tail is the
/// wilderness block, and another one tracks mapped blocks.
///
/// ```text
///   head                                                  tail
///    │                                                     │
///    ▼                                                     ▼
///  ┌────┬─────────┐   ┌────┬──────┐   ┌────┬─────────────────┐
///  │ H  │ block A │ ⇄ │ H  │ B    │ ⇄ │ H  │ block C         │
///  └────┴─────────┘   └────┴──────┘   └────┴─────────────────┘
///   low address                                  high address
/// ```
pub(crate) struct BlockList {
  pub head: Link,
  pub tail: Link,
  pub len: usize,
}

impl BlockList {
  pub const fn new() -> Self {
    Self {
      head: None,
      tail: None,
      len: 0,
    }
  }

  /// Appends `block` after the current tail.
  ///
  /// # Safety
  ///
  /// `block` must be a valid header that is not linked in any list, and
  /// its address must be higher than the address of the current tail.
  pub unsafe fn append(
    &mut self,
    mut block: NonNull<Block>,
  ) {
    unsafe {
      block.as_mut().prev = self.tail;
      block.as_mut().next = None;

      match self.tail {
        Some(mut tail) => tail.as_mut().next = Some(block),
        None => self.head = Some(block),
      }

      self.tail = Some(block);
      self.len += 1;
    }
  }

  /// Links `block` right after `node`, moving the tail if `node` was the
  /// tail.
  ///
  /// # Safety
  ///
  /// Both headers must be valid, `node` must belong to this list and
  /// `block` must lie between `node` and its current successor.
  pub unsafe fn insert_after(
    &mut self,
    mut node: NonNull<Block>,
    mut block: NonNull<Block>,
  ) {
    unsafe {
      block.as_mut().prev = Some(node);
      block.as_mut().next = node.as_ref().next;

      match node.as_ref().next {
        Some(mut next) => next.as_mut().prev = Some(block),
        None => self.tail = Some(block),
      }

      node.as_mut().next = Some(block);
      self.len += 1;
    }
  }

  /// Unlinks `block`. Head and tail are updated when needed.
  ///
  /// # Safety
  ///
  /// `block` must be a valid header linked in this list.
  pub unsafe fn remove(
    &mut self,
    mut block: NonNull<Block>,
  ) {
    unsafe {
      let prev = block.as_ref().prev;
      let next = block.as_ref().next;

      match prev {
        Some(mut prev) => prev.as_mut().next = next,
        None => self.head = next,
      }

      match next {
        Some(mut next) => next.as_mut().prev = prev,
        None => self.tail = prev,
      }

      block.as_mut().prev = None;
      block.as_mut().next = None;
      self.len -= 1;
    }
  }

  pub fn iter(&self) -> Iter<'_> {
    Iter {
      current: self.head,
      marker: PhantomData,
    }
  }
}

/// Front to back iterator over the headers of a [`BlockList`].
pub(crate) struct Iter<'a> {
  current: Link,
  marker: PhantomData<&'a BlockList>,
}

impl<'a> Iterator for Iter<'a> {
  type Item = &'a Block;

  fn next(&mut self) -> Option<Self::Item> {
    // Headers linked in a list stay valid while the list is borrowed.
    let block = unsafe { self.current?.as_ref() };
    self.current = block.next;

    Some(block)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::{Backing, HEADER_SIZE};

  /// Writes `count` contiguous 16 byte blocks into `memory`.
  fn carve(
    memory: &mut [u64],
    count: usize,
  ) -> Vec<NonNull<Block>> {
    let mut at = memory.as_mut_ptr().cast::<u8>();
    let mut blocks = Vec::new();

    for _ in 0..count {
      unsafe {
        let block = Block::write(NonNull::new(at).unwrap(), 16, Backing::Break);
        at = at.add(HEADER_SIZE + 16);
        blocks.push(block);
      }
    }

    blocks
  }

  fn addresses(list: &BlockList) -> Vec<*const Block> {
    list.iter().map(|block| block as *const Block).collect()
  }

  #[test]
  fn test_append_and_remove() {
    let mut memory = vec![0u64; 128];
    let blocks = carve(&mut memory, 3);
    let mut list = BlockList::new();

    unsafe {
      for block in &blocks {
        list.append(*block);
      }

      assert_eq!(list.len, 3);
      assert_eq!(list.head, Some(blocks[0]));
      assert_eq!(list.tail, Some(blocks[2]));

      list.remove(blocks[1]);
      assert_eq!(list.len, 2);
      assert_eq!(blocks[0].as_ref().next, Some(blocks[2]));
      assert_eq!(blocks[2].as_ref().prev, Some(blocks[0]));

      list.remove(blocks[2]);
      assert_eq!(list.tail, Some(blocks[0]));
      assert_eq!(blocks[0].as_ref().next, None);

      list.remove(blocks[0]);
      assert_eq!(list.len, 0);
      assert_eq!(list.head, None);
      assert_eq!(list.tail, None);
    }
  }

  #[test]
  fn test_insert_after_updates_tail() {
    let mut memory = vec![0u64; 128];
    let blocks = carve(&mut memory, 3);
    let mut list = BlockList::new();

    unsafe {
      list.append(blocks[0]);
      list.insert_after(blocks[0], blocks[2]);
      assert_eq!(list.tail, Some(blocks[2]));

      list.insert_after(blocks[0], blocks[1]);
      assert_eq!(list.tail, Some(blocks[2]));
      assert_eq!(list.len, 3);
    }

    let expected: Vec<*const Block> = blocks
      .iter()
      .map(|block| block.as_ptr() as *const Block)
      .collect();

    assert_eq!(addresses(&list), expected);
  }
}
