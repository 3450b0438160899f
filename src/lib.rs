//! # brkalloc - A Segregated Free List Allocator
//!
//! This crate provides a general purpose heap that manages memory obtained
//! from the operating system with `sbrk(2)` and `mmap(2)`, and hands it out
//! as variable size blocks that are reused, split and merged.
//!
//! ## Overview
//!
//! Every block carries an in-place header right before the memory handed to
//! the caller. Blocks carved from the program break live in an address ordered
//! list, large blocks get a mapping of their own:
//!
//! ```text
//!   Program break blocks (ascending addresses):
//!
//!   ┌────┬────────┬────┬──────┬────┬───────────────┬────┬────────────────┐
//!   │ H  │  used  │ H  │ free │ H  │     used      │ H  │  free (W)      │
//!   └────┴────────┴────┴──────┴────┴───────────────┴────┴────────────────┘
//!                                                                        ▲
//!                                                               Program Break
//!   W = wilderness block, the only one that can grow by moving the break.
//!
//!   Mapped blocks (>= 128 KiB each):
//!
//!   ┌────┬─────────────────────────┐   ┌────┬──────────────────────────────┐
//!   │ H  │  used                   │   │ H  │  used                        │
//!   └────┴─────────────────────────┘   └────┴──────────────────────────────┘
//! ```
//!
//! Free program break blocks are also indexed in 128 bins of 1 KiB each, so
//! finding a reusable block is a short scan over the bins instead of a walk
//! of the whole heap.
//!
//! ## Crate Structure
//!
//! ```text
//!   brkalloc
//!   ├── align      - Alignment macro and helpers
//!   ├── block      - Block header and adjacency arithmetic
//!   ├── list       - Address ordered intrusive block list
//!   ├── bins       - Segregated free lists
//!   ├── config     - Tunables and their validation
//!   ├── error      - Error types
//!   ├── source     - Operating system boundary (Sbrk, Arena)
//!   ├── heap       - The allocation engine
//!   ├── stats      - Reporting queries
//!   └── process    - Process wide heap behind a lock
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use brkalloc::{Arena, Heap};
//!
//! let mut heap = Heap::with_source(Arena::with_capacity(1 << 20)?);
//!
//! let address = heap.allocate(64)?;
//!
//! unsafe {
//!     address.as_ptr().write_bytes(0, 64);
//!     let address = heap.resize(address.as_ptr(), 256)?;
//!     heap.release(address.as_ptr());
//! }
//!
//! assert_eq!(heap.stats().free_blocks, 1);
//! # Ok::<(), brkalloc::HeapError>(())
//! ```
//!
//! ## How It Works
//!
//! 1. Requests are rounded up to 8 bytes. Zero and anything above 10^8 bytes
//!    is rejected.
//! 2. Requests of 128 KiB or more are mapped and unmapped on release.
//! 3. Smaller requests reuse the first free block that fits, starting at the
//!    bin for the requested size, and split off what is left if it is worth a
//!    block of its own.
//! 4. Failing that, a free wilderness block grows in place, or the break moves
//!    for a brand new block.
//! 5. Released blocks merge with free neighbours, so there are never two free
//!    blocks next to each other.
//!
//! ## Safety
//!
//! Allocation is safe, releasing and resizing take raw addresses and are
//! `unsafe`: handing the heap an address it didn't produce is undefined
//! behaviour. A [`Heap`] is not thread safe, use [`process`] for a locked
//! process wide instance.

pub mod align;
mod bins;
mod block;
mod config;
mod error;
mod heap;
mod list;
pub mod process;
mod source;
mod stats;

pub use bins::{BIN_COUNT, BIN_WIDTH, bin_index};
pub use block::{Backing, HEADER_SIZE};
pub use config::{HeapConfig, MAX_REQUEST, MIN_SPLIT, MMAP_THRESHOLD};
pub use error::{ConfigError, HeapError};
pub use heap::Heap;
pub use source::{Arena, MemorySource, Sbrk};
pub use stats::HeapStats;
