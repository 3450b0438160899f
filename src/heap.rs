use std::ptr::{self, NonNull};

use tracing::{debug, trace, warn};

use crate::{
  align,
  bins::{Bins, bin_index},
  block::{Backing, Block, HEADER_SIZE, Link, adjacent},
  config::HeapConfig,
  error::HeapError,
  list::BlockList,
  source::{MemorySource, Sbrk},
};

/// General purpose heap built on a program break and anonymous mappings.
///
/// Small and medium blocks are carved from the break and tracked in an
/// address ordered list whose tail, the wilderness block, can grow in place.
/// Free break blocks are indexed by size in [`Bins`]. Requests at or above
/// [`HeapConfig::mmap_threshold`] get a mapping of their own, tracked in a
/// second list, and go straight back to the kernel when released.
///
/// ```text
///   blocks:  ┌───┬──────┐┌───┬────┐┌───┬──────────┐┌───┬───────────┐
///            │ H │ used ││ H │free││ H │   used   ││ H │ free (W)  │ ← break
///            └───┴──────┘└───┴────┘└───┴──────────┘└───┴───────────┘
///                           ▲                             ▲
///   bins[0] ────────────────┘                             │
///   bins[3] ──────────────────────────────────────────────┘
///
///   mapped:  ┌───┬──────────────────┐    ┌───┬────────────────────────┐
///            │ H │  >= 128 KiB      │ ⇄  │ H │  >= 128 KiB            │
///            └───┴──────────────────┘    └───┴────────────────────────┘
/// ```
///
/// The heap is a plain context object without internal locking: it is
/// neither `Send` nor `Sync`, and callers serialize access themselves. See
/// [`crate::process`] for a process wide instance.
pub struct Heap<S: MemorySource = Sbrk> {
  source: S,
  config: HeapConfig,
  /// Program break blocks, ascending addresses. The tail is the wilderness.
  blocks: BlockList,
  /// Mapped blocks, in mapping order.
  mapped: BlockList,
  bins: Bins,
}

impl Heap<Sbrk> {
  /// Heap on the real program break of the process, default configuration.
  pub const fn new() -> Self {
    Self::with_source(Sbrk)
  }
}

impl Default for Heap<Sbrk> {
  fn default() -> Self {
    Self::new()
  }
}

impl<S: MemorySource> Heap<S> {
  /// Builds an empty heap on top of `source` with the default configuration.
  /// Nothing is requested from the source until the first allocation.
  pub const fn with_source(source: S) -> Self {
    Self {
      source,
      config: HeapConfig::DEFAULT,
      blocks: BlockList::new(),
      mapped: BlockList::new(),
      bins: Bins::new(),
    }
  }

  /// Same as [`Heap::with_source`] with a custom configuration.
  pub fn with_config(
    source: S,
    config: HeapConfig,
  ) -> Result<Self, HeapError> {
    config.validate()?;

    Ok(Self {
      source,
      config,
      blocks: BlockList::new(),
      mapped: BlockList::new(),
      bins: Bins::new(),
    })
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  /// Returns the address of a block that can hold at least `size` bytes.
  ///
  /// Sizes are rounded up to 8 bytes first. Zero sized requests and requests
  /// above [`HeapConfig::max_request`] fail without touching the heap, and so
  /// do requests the operating system refuses to back.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    let size = self.request_size(size)?;
    let block = unsafe { self.allocate_block(size)? };

    Ok(unsafe { block.as_ref().usable() })
  }

  /// Allocates room for `count` elements of `size` bytes and zeroes it.
  pub fn zero_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    let Some(total) = count.checked_mul(size) else {
      warn!(count, size, "rejected zeroed allocation, size overflows");
      return Err(HeapError::Overflow { count, size });
    };

    let address = self.allocate(total)?;

    unsafe {
      let block = Block::from_address(address);
      ptr::write_bytes(address.as_ptr(), 0, block.as_ref().size);
    }

    Ok(address)
  }

  /// Gives a block back. Break blocks are merged with free neighbours and
  /// binned for reuse, mapped blocks are unmapped right away. Null is
  /// ignored, and so is a block that is already free.
  ///
  /// # Safety
  ///
  /// `address` must be null or an address returned by this heap that hasn't
  /// been handed to [`Heap::resize`] since. Releasing an address twice is only
  /// detected for program break blocks, and only as long as the header hasn't
  /// been merged into a neighbour or reused by another block. A mapped block's
  /// header is unmapped by the first release, so releasing it again reads
  /// unmapped memory.
  pub unsafe fn release(
    &mut self,
    address: *mut u8,
  ) {
    let Some(address) = NonNull::new(address) else {
      return;
    };

    unsafe {
      let block = Block::from_address(address);

      if block.as_ref().is_free {
        warn!(?address, "ignoring release of a block that is already free");
        return;
      }

      self.release_block(block);
    }
  }

  /// Resizes the block at `address` to hold `size` bytes, moving it only when
  /// it can't grow in place. The returned address may differ from `address`;
  /// the first `min(old, new)` bytes are preserved. A null `address` behaves
  /// like [`Heap::allocate`].
  ///
  /// On error the old block is left untouched and still owned by the caller.
  ///
  /// # Safety
  ///
  /// `address` must be null or a live address returned by this heap.
  pub unsafe fn resize(
    &mut self,
    address: *mut u8,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    let Some(address) = NonNull::new(address) else {
      return self.allocate(size);
    };

    let size = self.request_size(size)?;

    unsafe {
      let block = Block::from_address(address);

      let block = match block.as_ref().backing {
        Backing::Break => self.resize_break(block, size)?,
        Backing::Mapped => self.resize_mapped(block, size)?,
      };

      Ok(block.as_ref().usable())
    }
  }

  /// Usable size of the block at `address`, which can be bigger than what was
  /// requested.
  ///
  /// # Safety
  ///
  /// `address` must be a live address returned by this heap.
  pub unsafe fn usable_size(
    &self,
    address: NonNull<u8>,
  ) -> usize {
    unsafe { Block::from_address(address).as_ref().size }
  }

  /// Aligns and validates a caller supplied size.
  fn request_size(
    &self,
    size: usize,
  ) -> Result<usize, HeapError> {
    match align::checked_align(size) {
      Some(aligned) if aligned != 0 && aligned <= self.config.max_request => Ok(aligned),
      _ => {
        warn!(size, max = self.config.max_request, "rejected allocation request");
        Err(HeapError::InvalidSize { requested: size })
      }
    }
  }

  /// Allocation algorithm, `size` is already aligned and validated:
  ///
  /// 1. Big requests get their own mapping.
  /// 2. Otherwise reuse the first fit found in the bins, splitting it.
  /// 3. Otherwise grow the wilderness block if it's free.
  /// 4. Otherwise move the break for a brand new block.
  unsafe fn allocate_block(
    &mut self,
    size: usize,
  ) -> Result<NonNull<Block>, HeapError> {
    unsafe {
      if size >= self.config.mmap_threshold {
        return self.map_block(size);
      }

      if let Some(mut block) = self.bins.find_fit(size) {
        trace!(size, found = block.as_ref().size, bin = bin_index(size), "reusing free block");
        self.bins.remove(block);
        block.as_mut().is_free = false;
        self.split(block, size);
        return Ok(block);
      }

      if let Some(block) = self.grow_free_wilderness(size)? {
        return Ok(block);
      }

      self.extend_heap(size)
    }
  }

  /// Maps a dedicated region for `size` bytes plus header.
  unsafe fn map_block(
    &mut self,
    size: usize,
  ) -> Result<NonNull<Block>, HeapError> {
    unsafe {
      let address = self.source.map(size + HEADER_SIZE)?;
      let block = Block::write(address, size, Backing::Mapped);
      self.mapped.append(block);

      trace!(size, ?address, "mapped block");

      Ok(block)
    }
  }

  /// Moves the break for a new block of `size` bytes appended to the list.
  unsafe fn extend_heap(
    &mut self,
    size: usize,
  ) -> Result<NonNull<Block>, HeapError> {
    unsafe {
      let address = self.source.extend_break(size + HEADER_SIZE)?;
      let block = Block::write(address, size, Backing::Break);
      self.blocks.append(block);

      trace!(size, ?address, "appended block at the break");

      Ok(block)
    }
  }

  /// Whether the wilderness block still ends exactly at the break, which is
  /// required to grow it in place.
  fn wilderness_at_break(
    &self,
    block: NonNull<Block>,
  ) -> bool {
    self.blocks.tail == Some(block)
      && unsafe { block.as_ref().end() } == self.source.current_break()
  }

  /// If the wilderness block is free, grows it to `size` bytes by moving the
  /// break only by the missing amount, since its header already exists.
  unsafe fn grow_free_wilderness(
    &mut self,
    size: usize,
  ) -> Result<Link, HeapError> {
    unsafe {
      let Some(mut tail) = self.blocks.tail else {
        return Ok(None);
      };

      if !tail.as_ref().is_free || !self.wilderness_at_break(tail) {
        return Ok(None);
      }

      let increment = size - tail.as_ref().size;
      self.source.extend_break(increment)?;

      self.bins.remove(tail);
      tail.as_mut().size = size;
      tail.as_mut().is_free = false;

      trace!(size, increment, "grew free wilderness block");

      Ok(Some(tail))
    }
  }

  /// Shrinks an allocated `block` to `size` bytes when the leftover, minus the
  /// header it needs, reaches [`HeapConfig::min_split`]. The leftover becomes
  /// a new block right after it and is released like any other block, so it
  /// merges with a free right neighbour.
  ///
  /// ```text
  ///   before:  ┌───┬──────────────────────────────────┐
  ///            │ H │ size                             │
  ///            └───┴──────────────────────────────────┘
  ///   after:   ┌───┬──────────┬───┬───────────────────┐
  ///            │ H │ size     │ H │ leftover (free)   │
  ///            └───┴──────────┴───┴───────────────────┘
  /// ```
  unsafe fn split(
    &mut self,
    mut block: NonNull<Block>,
    size: usize,
  ) {
    unsafe {
      let leftover = match block.as_ref().size.checked_sub(size + HEADER_SIZE) {
        Some(leftover) if leftover >= self.config.min_split => leftover,
        _ => return,
      };

      let at = NonNull::new_unchecked(block.as_ref().address.add(size));
      let sibling = Block::write(at, leftover, Backing::Break);

      block.as_mut().size = size;
      self.blocks.insert_after(block, sibling);

      trace!(size, leftover, "split block");

      self.release_block(sibling);
    }
  }

  /// Marks `block` free and puts it back where it belongs.
  unsafe fn release_block(
    &mut self,
    mut block: NonNull<Block>,
  ) {
    unsafe {
      block.as_mut().is_free = true;

      match block.as_ref().backing {
        Backing::Mapped => self.unmap_block(block),
        Backing::Break => {
          let block = self.coalesce(block);
          self.bins.insert(block);
        }
      }
    }
  }

  /// Unlinks a mapped block and returns its memory to the kernel.
  unsafe fn unmap_block(
    &mut self,
    block: NonNull<Block>,
  ) {
    unsafe {
      let length = block.as_ref().total_size();
      self.mapped.remove(block);

      // Already unlinked, a failure here can only leak the region.
      if let Err(err) = self.source.unmap(block.cast(), length) {
        warn!(%err, length, "failed to unmap block");
      }
    }
  }

  /// Merges a free, unbinned `block` with its free neighbours, next first and
  /// then previous, and returns the header of the result.
  ///
  /// ```text
  ///   ┌───┬──────┬───┬──────┬───┬──────┐       ┌───┬────────────────────────┐
  ///   │ H │ free │ H │ this │ H │ free │  ──▶  │ H │ A + B + C + 2H         │
  ///   └───┴──────┴───┴──────┴───┴──────┘       └───┴────────────────────────┘
  /// ```
  unsafe fn coalesce(
    &mut self,
    mut block: NonNull<Block>,
  ) -> NonNull<Block> {
    unsafe {
      if let Some(next) = self.free_next(block) {
        self.bins.remove(next);
        self.absorb_next(block);
      }

      if let Some(prev) = self.free_prev(block) {
        self.bins.remove(prev);
        self.absorb_next(prev);
        block = prev;
      }

      block
    }
  }

  /// Right neighbour of `block` if it's free and contiguous.
  unsafe fn free_next(
    &self,
    block: NonNull<Block>,
  ) -> Link {
    unsafe {
      block
        .as_ref()
        .next
        .filter(|next| next.as_ref().is_free && adjacent(block, *next))
    }
  }

  /// Left neighbour of `block` if it's free and contiguous.
  unsafe fn free_prev(
    &self,
    block: NonNull<Block>,
  ) -> Link {
    unsafe {
      block
        .as_ref()
        .prev
        .filter(|prev| prev.as_ref().is_free && adjacent(*prev, block))
    }
  }

  /// Folds the right neighbour of `block`, header included, into `block`.
  /// The neighbour must already be out of the bins.
  unsafe fn absorb_next(
    &mut self,
    mut block: NonNull<Block>,
  ) {
    unsafe {
      let Some(next) = block.as_ref().next else {
        return;
      };

      block.as_mut().size += next.as_ref().total_size();
      self.blocks.remove(next);

      trace!(size = block.as_ref().size, "merged adjacent blocks");
    }
  }

  /// Resize policy for break blocks:
  ///
  /// 1. Shrinking or same size stays in place, splitting off the leftover.
  /// 2. Merge with free neighbours if that's enough: previous, next, both.
  /// 3. Grow the wilderness block by moving the break.
  /// 4. Move to a new block.
  unsafe fn resize_break(
    &mut self,
    block: NonNull<Block>,
    size: usize,
  ) -> Result<NonNull<Block>, HeapError> {
    unsafe {
      if size <= block.as_ref().size {
        self.split(block, size);
        return Ok(block);
      }

      if let Some(merged) = self.grow_into_neighbours(block, size) {
        return Ok(merged);
      }

      if self.wilderness_at_break(block) {
        match self.grow_wilderness(block, size) {
          Ok(grown) => return Ok(grown),
          Err(err) => debug!(%err, "wilderness can't grow, moving block instead"),
        }
      }

      self.relocate(block, size)
    }
  }

  /// Resize step 2. Returns `None` without touching anything when no
  /// combination of free neighbours is big enough.
  unsafe fn grow_into_neighbours(
    &mut self,
    block: NonNull<Block>,
    size: usize,
  ) -> Link {
    unsafe {
      let prev = self.free_prev(block);
      let next = self.free_next(block);

      let own = block.as_ref().size;
      let with_prev = prev.map(|prev| prev.as_ref().total_size() + own);
      let with_next = next.map(|next| own + next.as_ref().total_size());

      let (merge_prev, merge_next) = match (with_prev, with_next) {
        (Some(merged), _) if merged >= size => (true, false),
        (_, Some(merged)) if merged >= size => (false, true),
        (Some(left), Some(right)) if left + right - own >= size => (true, true),
        _ => return None,
      };

      let source = block.as_ref().address;
      let payload = own;
      let mut merged = block;

      if let Some(next) = next.filter(|_| merge_next) {
        self.bins.remove(next);
        self.absorb_next(block);
      }

      if let Some(prev) = prev.filter(|_| merge_prev) {
        self.bins.remove(prev);
        self.absorb_next(prev);
        merged = prev;
      }

      merged.as_mut().is_free = false;

      if merged != block {
        ptr::copy(source, merged.as_ref().address, payload);
      }

      trace!(size, merge_prev, merge_next, "grew block into free neighbours");

      self.split(merged, size);

      Some(merged)
    }
  }

  /// Resize step 3. `block` is the wilderness block and ends at the break.
  /// A free left neighbour is folded in first so the break only moves by what
  /// is still missing. The break moves before anything else is touched.
  unsafe fn grow_wilderness(
    &mut self,
    block: NonNull<Block>,
    size: usize,
  ) -> Result<NonNull<Block>, HeapError> {
    unsafe {
      let prev = self.free_prev(block);
      let own = block.as_ref().size;
      let available = prev.map_or(own, |prev| prev.as_ref().total_size() + own);

      let increment = size - available;
      self.source.extend_break(increment)?;

      let source = block.as_ref().address;
      let mut grown = block;

      if let Some(prev) = prev {
        self.bins.remove(prev);
        self.absorb_next(prev);
        grown = prev;
      }

      grown.as_mut().size = size;
      grown.as_mut().is_free = false;

      if grown != block {
        ptr::copy(source, grown.as_ref().address, own);
      }

      trace!(size, increment, "grew wilderness block in place");

      Ok(grown)
    }
  }

  /// Resize for mapped blocks. A mapping is kept whole whenever the new size
  /// fits, even below the mapping threshold; mapped blocks are never split.
  unsafe fn resize_mapped(
    &mut self,
    block: NonNull<Block>,
    size: usize,
  ) -> Result<NonNull<Block>, HeapError> {
    unsafe {
      if size <= block.as_ref().size {
        return Ok(block);
      }

      self.relocate(block, size)
    }
  }

  /// Resize step 4: allocate a new block, copy the payload, release the old
  /// one. The old block is only released once the new one exists.
  unsafe fn relocate(
    &mut self,
    block: NonNull<Block>,
    size: usize,
  ) -> Result<NonNull<Block>, HeapError> {
    unsafe {
      let new = self.allocate_block(size)?;
      let count = block.as_ref().size.min(size);

      ptr::copy_nonoverlapping(block.as_ref().address, new.as_ref().address, count);

      trace!(size, count, "moved block");

      self.release_block(block);

      Ok(new)
    }
  }

  /// Program break blocks, lowest address first.
  pub(crate) fn break_blocks(&self) -> impl Iterator<Item = &Block> + '_ {
    self.blocks.iter()
  }

  /// Mapped blocks.
  pub(crate) fn mapped_blocks(&self) -> impl Iterator<Item = &Block> + '_ {
    self.mapped.iter()
  }

  /// Walks every structure and verifies the heap invariants: ordering and
  /// linkage of both lists, alignment, no uncoalesced free neighbours, and
  /// agreement between free flags and bins.
  pub fn check_invariants(&self) -> Result<(), HeapError> {
    let corrupted = |reason: String| Err(HeapError::Corrupted { reason });

    let mut free = 0;
    let mut count = 0;
    let mut previous: Option<&Block> = None;

    for block in self.break_blocks() {
      let header = block as *const Block as *mut u8;
      count += 1;

      if block.address != header.wrapping_add(HEADER_SIZE) {
        return corrupted(format!("block {header:?} has a stale usable address"));
      }
      if block.size % align::ALIGNMENT != 0 {
        return corrupted(format!("block {header:?} has unaligned size {}", block.size));
      }
      if block.backing != Backing::Break {
        return corrupted(format!("mapped block {header:?} in the break list"));
      }
      if block.is_free {
        free += 1;
      }

      let prev_link = block.prev.map(|prev| prev.as_ptr() as *const Block);
      if prev_link != previous.map(|prev| prev as *const Block) {
        return corrupted(format!("block {header:?} has a broken back link"));
      }

      if let Some(previous) = previous {
        if previous.end() > header {
          return corrupted(format!("block {header:?} overlaps or precedes its predecessor"));
        }
        if previous.end() == header && previous.is_free && block.is_free {
          return corrupted(format!("adjacent free blocks at {header:?}"));
        }
      }

      previous = Some(block);
    }

    if count != self.blocks.len {
      return corrupted(format!("break list holds {count} blocks, expected {}", self.blocks.len));
    }
    if self.blocks.tail.map(|tail| tail.as_ptr() as *const Block) != previous.map(|last| last as *const Block) {
      return corrupted("break list tail isn't its last block".to_owned());
    }

    for block in self.mapped_blocks() {
      if block.backing != Backing::Mapped || block.is_free {
        return corrupted(format!("bad block {:?} in the mapped list", block as *const Block));
      }
    }

    for (index, block) in self.bins.iter() {
      if !block.is_free || block.backing != Backing::Break {
        return corrupted(format!("bin {index} holds a block that isn't a free break block"));
      }
      if bin_index(block.size) != index {
        return corrupted(format!("block of {} bytes sits in bin {index}", block.size));
      }
    }

    if self.bins.len() != free || self.bins.iter().count() != free {
      return corrupted(format!("{free} free blocks but {} binned", self.bins.len()));
    }

    Ok(())
  }
}

impl<S: MemorySource> Drop for Heap<S> {
  /// Mapped blocks are returned to the kernel. Break memory can't be given
  /// back piecemeal and stays with the source.
  fn drop(&mut self) {
    while let Some(block) = self.mapped.head {
      unsafe { self.unmap_block(block) };
    }
  }
}
