//! Process wide heap on the real program break.
//!
//! These functions mirror the classic C primitives: failures are reported as
//! null pointers and the reason is logged. Every call takes a global lock, so
//! they can be used from any thread. Other code moving the break is tolerated,
//! the heap simply stops growing its last block in place when that happens.

use std::{ptr, sync::Mutex};

use tracing::warn;

use crate::{
  error::HeapError,
  heap::Heap,
  source::Sbrk,
  stats::HeapStats,
};

/// The engine holds raw pointers into memory that only it manages, so moving
/// it to another thread behind the lock is fine.
struct ProcessHeap(Heap<Sbrk>);

unsafe impl Send for ProcessHeap {}

static HEAP: Mutex<ProcessHeap> = Mutex::new(ProcessHeap(Heap::new()));

fn into_raw(result: Result<ptr::NonNull<u8>, HeapError>) -> *mut u8 {
  match result {
    Ok(address) => address.as_ptr(),
    Err(err) => {
      warn!(%err, "process heap request failed");
      ptr::null_mut()
    }
  }
}

/// See [`Heap::allocate`]. Returns null on failure.
pub fn allocate(size: usize) -> *mut u8 {
  match HEAP.lock() {
    Ok(mut heap) => into_raw(heap.0.allocate(size)),
    Err(_) => ptr::null_mut(),
  }
}

/// See [`Heap::zero_allocate`]. Returns null on failure.
pub fn zero_allocate(
  count: usize,
  size: usize,
) -> *mut u8 {
  match HEAP.lock() {
    Ok(mut heap) => into_raw(heap.0.zero_allocate(count, size)),
    Err(_) => ptr::null_mut(),
  }
}

/// See [`Heap::release`].
///
/// # Safety
///
/// `address` must be null or returned by this module and not released yet.
pub unsafe fn release(address: *mut u8) {
  if let Ok(mut heap) = HEAP.lock() {
    unsafe { heap.0.release(address) }
  }
}

/// See [`Heap::resize`]. Returns null on failure, in which case `address` is
/// still valid and unchanged.
///
/// # Safety
///
/// `address` must be null or a live address returned by this module.
pub unsafe fn resize(
  address: *mut u8,
  size: usize,
) -> *mut u8 {
  match HEAP.lock() {
    Ok(mut heap) => into_raw(unsafe { heap.0.resize(address, size) }),
    Err(_) => ptr::null_mut(),
  }
}

/// Snapshot of the process heap, see [`Heap::stats`].
pub fn stats() -> HeapStats {
  match HEAP.lock() {
    Ok(heap) => heap.0.stats(),
    Err(_) => HeapStats::default(),
  }
}
