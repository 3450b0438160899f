use std::{io, ptr, ptr::NonNull};

use libc::{c_void, intptr_t, sbrk};
use tracing::debug;

use crate::{align, error::HeapError};

/// Operating system boundary of the heap. The engine only needs to move a
/// program break forward and to create and destroy anonymous mappings; it
/// doesn't care whether the break is the real one of the process or a
/// simulated one inside a reservation.
///
/// Every method is all-or-nothing: on error nothing was obtained or released.
pub trait MemorySource {
  /// Current end of the break managed by this source.
  fn current_break(&self) -> *mut u8;

  /// Moves the break `increment` bytes forward and returns the old break,
  /// which is the start of the new memory. The returned address is aligned to
  /// [`crate::align::ALIGNMENT`].
  ///
  /// # Safety
  ///
  /// The new memory is handed out raw, the caller owns its contents.
  unsafe fn extend_break(
    &mut self,
    increment: usize,
  ) -> Result<NonNull<u8>, HeapError>;

  /// Creates a private, read-write anonymous mapping of `length` bytes.
  ///
  /// # Safety
  ///
  /// Same as [`MemorySource::extend_break`].
  unsafe fn map(
    &mut self,
    length: usize,
  ) -> Result<NonNull<u8>, HeapError>;

  /// Destroys a mapping created by [`MemorySource::map`].
  ///
  /// # Safety
  ///
  /// `address` and `length` must describe a live mapping from this source,
  /// and nothing may touch it afterwards.
  unsafe fn unmap(
    &mut self,
    address: NonNull<u8>,
    length: usize,
  ) -> Result<(), HeapError>;
}

/// Calls `mmap` for a private anonymous read-write region.
pub(crate) unsafe fn map_anonymous(length: usize) -> Result<NonNull<u8>, HeapError> {
  // Memory protection. Read-Write only.
  let protection = libc::PROT_READ | libc::PROT_WRITE;
  // Memory should be private to our process and not mapped to any file.
  let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

  let address = unsafe { libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0) };

  if address == libc::MAP_FAILED {
    return Err(HeapError::MapFailed {
      length,
      source: io::Error::last_os_error(),
    });
  }

  debug!(length, ?address, "mapped anonymous region");

  NonNull::new(address.cast::<u8>()).ok_or_else(|| HeapError::MapFailed {
    length,
    source: io::Error::other("mmap returned null"),
  })
}

/// Calls `munmap` on a region returned by [`map_anonymous`].
pub(crate) unsafe fn unmap_anonymous(
  address: NonNull<u8>,
  length: usize,
) -> Result<(), HeapError> {
  if unsafe { libc::munmap(address.as_ptr().cast::<c_void>(), length) } != 0 {
    return Err(HeapError::UnmapFailed {
      length,
      source: io::Error::last_os_error(),
    });
  }

  debug!(length, ?address, "unmapped anonymous region");

  Ok(())
}

/// The real program break of the process, moved with `sbrk(2)`, plus
/// `mmap(2)` for large blocks.
///
/// ```text
///   High Address ┌─────────────────────┐
///                │       Stack         │ ↓ grows down
///                │                     │
///                │  anonymous mappings │ ← Sbrk::map
///                │                     │
///                │       Heap          │ ↑ grows up (sbrk)
///                ├─────────────────────┤ ← Program Break
///                │   Data / BSS        │
///   Low Address  └─────────────────────┘
/// ```
///
/// The break is shared with anything else in the process that calls `sbrk`,
/// which is why the heap checks that its last block still ends at the break
/// before growing that block in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sbrk;

impl MemorySource for Sbrk {
  fn current_break(&self) -> *mut u8 {
    unsafe { sbrk(0).cast::<u8>() }
  }

  unsafe fn extend_break(
    &mut self,
    increment: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    unsafe {
      // The initial break isn't necessarily aligned, pay for the padding once.
      let current = sbrk(0) as usize;
      let padding = align!(current) - current;

      let total = increment
        .checked_add(padding)
        .and_then(|total| intptr_t::try_from(total).ok())
        .ok_or_else(|| HeapError::BreakExhausted {
          increment,
          source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;

      let address = sbrk(total);

      if address == usize::MAX as *mut c_void {
        return Err(HeapError::BreakExhausted {
          increment,
          source: io::Error::last_os_error(),
        });
      }

      debug!(increment, padding, ?address, "moved program break");

      Ok(NonNull::new_unchecked(address.cast::<u8>().add(padding)))
    }
  }

  unsafe fn map(
    &mut self,
    length: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    unsafe { map_anonymous(length) }
  }

  unsafe fn unmap(
    &mut self,
    address: NonNull<u8>,
    length: usize,
  ) -> Result<(), HeapError> {
    unsafe { unmap_anonymous(address, length) }
  }
}

/// A private program break simulated inside a single anonymous reservation.
/// It behaves like `sbrk` except that it never collides with other users of
/// the real break and that it refuses to grow past its capacity, which makes
/// it useful to run several independent heaps in one process or to cap how
/// much memory a heap may take.
///
/// ```text
///   base                      break                       base + capacity
///    │                          │                               │
///    ▼                          ▼                               ▼
///    ┌──────────────────────────┬───────────────────────────────┐
///    │   blocks handed out      │        untouched reserve      │
///    └──────────────────────────┴───────────────────────────────┘
/// ```
///
/// Large blocks still get real anonymous mappings.
#[derive(Debug)]
pub struct Arena {
  base: NonNull<u8>,
  capacity: usize,
  used: usize,
}

impl Arena {
  /// Reserves `capacity` bytes (rounded up to the alignment). Pages are only
  /// backed by physical memory once they are touched.
  pub fn with_capacity(capacity: usize) -> Result<Self, HeapError> {
    let capacity = align!(capacity.max(1));
    let base = unsafe { map_anonymous(capacity)? };

    Ok(Self {
      base,
      capacity,
      used: 0,
    })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes between the base and the current break.
  pub fn used(&self) -> usize {
    self.used
  }

  /// First address of the reservation.
  pub fn base(&self) -> NonNull<u8> {
    self.base
  }
}

impl MemorySource for Arena {
  fn current_break(&self) -> *mut u8 {
    self.base.as_ptr().wrapping_add(self.used)
  }

  unsafe fn extend_break(
    &mut self,
    increment: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    let available = self.capacity - self.used;

    if increment > available {
      return Err(HeapError::BreakExhausted {
        increment,
        source: io::Error::from(io::ErrorKind::OutOfMemory),
      });
    }

    let address = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.used)) };
    self.used += align!(increment);

    debug!(increment, used = self.used, capacity = self.capacity, "moved arena break");

    Ok(address)
  }

  unsafe fn map(
    &mut self,
    length: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    unsafe { map_anonymous(length) }
  }

  unsafe fn unmap(
    &mut self,
    address: NonNull<u8>,
    length: usize,
  ) -> Result<(), HeapError> {
    unsafe { unmap_anonymous(address, length) }
  }
}

impl Drop for Arena {
  fn drop(&mut self) {
    if let Err(err) = unsafe { unmap_anonymous(self.base, self.capacity) } {
      tracing::warn!(%err, "failed to release arena reservation");
    }
  }
}
