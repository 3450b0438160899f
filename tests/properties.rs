use std::ptr::NonNull;

use brkalloc::{Arena, Heap, align};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
  Allocate(usize),
  ZeroAllocate(usize, usize),
  Release(usize),
  Resize(usize, usize),
}

fn size() -> impl Strategy<Value = usize> {
  prop_oneof![
    6 => 1usize..2048,
    3 => 2048usize..20_000,
    1 => 130_000usize..200_000,
  ]
}

fn op() -> impl Strategy<Value = Op> {
  prop_oneof![
    4 => size().prop_map(Op::Allocate),
    1 => (1usize..64, 1usize..64).prop_map(|(count, size)| Op::ZeroAllocate(count, size)),
    3 => any::<usize>().prop_map(Op::Release),
    2 => (any::<usize>(), size()).prop_map(|(index, size)| Op::Resize(index, size)),
  ]
}

/// A block owned by the test, filled with `pattern` over `len` bytes.
struct Live {
  address: NonNull<u8>,
  len: usize,
  pattern: u8,
}

impl Live {
  fn fill(&self) {
    unsafe { self.address.as_ptr().write_bytes(self.pattern, self.len) };
  }

  fn intact(&self) -> bool {
    let bytes = unsafe { std::slice::from_raw_parts(self.address.as_ptr(), self.len) };
    bytes.iter().all(|byte| *byte == self.pattern)
  }
}

fn check(
  heap: &Heap<Arena>,
  live: &[Live],
) -> Result<(), TestCaseError> {
  heap
    .check_invariants()
    .map_err(|err| TestCaseError::fail(err.to_string()))?;

  let stats = heap.stats();
  let in_use: usize = live
    .iter()
    .map(|block| unsafe { heap.usable_size(block.address) })
    .sum();

  prop_assert_eq!(stats.in_use_blocks(), live.len());
  prop_assert_eq!(stats.in_use_bytes(), in_use);
  prop_assert_eq!(stats.allocated_blocks, stats.free_blocks + live.len());
  prop_assert_eq!(stats.metadata_bytes, stats.allocated_blocks * stats.header_size);

  for block in live {
    prop_assert!(block.intact(), "payload of {:?} was overwritten", block.address);
  }

  Ok(())
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(128))]

  #[test]
  fn random_sequences_keep_heap_consistent(ops in prop::collection::vec(op(), 1..64)) {
    let mut heap = Heap::with_source(Arena::with_capacity(1 << 26).unwrap());
    let mut live: Vec<Live> = Vec::new();

    for (step, op) in ops.into_iter().enumerate() {
      let pattern = step as u8;

      match op {
        Op::Allocate(size) => {
          let address = heap.allocate(size).unwrap();
          let usable = unsafe { heap.usable_size(address) };
          prop_assert!(usable >= align!(size));

          let block = Live { address, len: size, pattern };
          block.fill();
          live.push(block);
        }
        Op::ZeroAllocate(count, size) => {
          let address = heap.zero_allocate(count, size).unwrap();
          let block = Live { address, len: count * size, pattern: 0 };
          prop_assert!(block.intact());
          live.push(block);
        }
        Op::Release(index) => {
          if live.is_empty() {
            continue;
          }
          let block = live.swap_remove(index % live.len());
          unsafe { heap.release(block.address.as_ptr()) };
        }
        Op::Resize(index, size) => {
          if live.is_empty() {
            continue;
          }
          let index = index % live.len();
          let old = &live[index];

          let address = unsafe { heap.resize(old.address.as_ptr(), size).unwrap() };
          let usable = unsafe { heap.usable_size(address) };
          prop_assert!(usable >= align!(size));

          // Preserved prefix keeps the old pattern, the rest gets refilled.
          let kept = Live { address, len: old.len.min(size), pattern: old.pattern };
          prop_assert!(kept.intact());

          let block = Live { address, len: size, pattern };
          block.fill();
          live[index] = block;
        }
      }

      check(&heap, &live)?;
    }

    for block in live.drain(..) {
      unsafe { heap.release(block.address.as_ptr()) };
    }

    check(&heap, &live)?;
    prop_assert_eq!(heap.stats().in_use_bytes(), 0);
    prop_assert!(heap.free_blocks() <= 1, "released heap left {} free blocks", heap.free_blocks());
  }

  #[test]
  fn released_block_is_reused_at_same_address(size in 1usize..100_000) {
    let mut heap = Heap::with_source(Arena::with_capacity(1 << 20).unwrap());

    let address = heap.allocate(size).unwrap();
    let _guard = heap.allocate(8).unwrap();
    unsafe { heap.release(address.as_ptr()) };

    prop_assert_eq!(heap.allocate(size).unwrap(), address);
  }
}
