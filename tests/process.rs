use std::{ptr, thread};

use brkalloc::{HEADER_SIZE, MAX_REQUEST, MMAP_THRESHOLD, process};

#[test]
fn test_allocate_write_release() {
  let address = process::allocate(100);
  assert!(!address.is_null());
  assert_eq!(address as usize % 8, 0);

  unsafe {
    address.write_bytes(0xCD, 100);
    assert_eq!(*address.add(99), 0xCD);
    process::release(address);
  }
}

#[test]
fn test_failures_return_null() {
  assert!(process::allocate(0).is_null());
  assert!(process::allocate(MAX_REQUEST + 10).is_null());
  assert!(process::zero_allocate(usize::MAX, 2).is_null());

  unsafe {
    assert!(process::resize(ptr::null_mut(), 0).is_null());
    process::release(ptr::null_mut());
  }
}

#[test]
fn test_zero_allocate_and_resize() {
  let address = process::zero_allocate(16, 4);
  assert!(!address.is_null());

  unsafe {
    assert!((0..64).all(|i| *address.add(i) == 0));
    address.write_bytes(0x42, 64);

    let grown = process::resize(address, MMAP_THRESHOLD);
    assert!(!grown.is_null());
    assert!((0..64).all(|i| *grown.add(i) == 0x42));

    process::release(grown);
  }
}

#[test]
fn test_concurrent_use() {
  let workers: Vec<_> = (0..4u8)
    .map(|worker| {
      thread::spawn(move || {
        for round in 0..200usize {
          let size = 16 + (round * 37) % 4000;
          let address = process::allocate(size);
          assert!(!address.is_null());

          unsafe {
            address.write_bytes(worker, size);
            assert!((0..size).all(|i| *address.add(i) == worker));
            process::release(address);
          }
        }
      })
    })
    .collect();

  for worker in workers {
    worker.join().unwrap();
  }

  let stats = process::stats();
  assert_eq!(stats.header_size, HEADER_SIZE);
  assert!(stats.free_bytes <= stats.allocated_bytes);
}
