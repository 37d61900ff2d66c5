use core::{
  alloc::Layout,
  mem::size_of,
  ptr::{NonNull, null_mut},
};
use std::alloc::{GlobalAlloc, System};

use crate::{
  AllocError, POOL_BLOCK_SIZE, padding_for,
  slot::{FreeStack, Slot},
  sync::SpinLock,
};

const LINK_SIZE: usize = size_of::<*mut u8>();
const BLOCK_LAYOUT: Layout = unsafe { Layout::from_size_align_unchecked(POOL_BLOCK_SIZE, LINK_SIZE) };

/// Bump state of the newest raw block. Only touched under the pool's lock.
struct BumpState {
  /// Newest block; each block's first word links to the previous one.
  blocks: *mut u8,
  /// Next never-used slot.
  cursor: usize,
  /// End of the last slot that fits in the newest block.
  limit: usize,
  block_count: usize,
  carved: usize,
}

unsafe impl Send for BumpState {}

/// Lock-free pool of `slot_size`-byte slots carved out of fixed-size raw blocks.
///
/// Reclaimed slots go on a lock-free stack and are reused before the bump
/// allocator is touched. Raw blocks are only given back when the pool drops.
pub struct SizeClassPool {
  slot_size: usize,
  free: FreeStack,
  bump: SpinLock<BumpState>,
}

impl SizeClassPool {
  pub fn new(slot_size: usize) -> Self {
    assert!(slot_size >= size_of::<Slot>(), "slot of {slot_size} bytes cannot hold a link");
    assert!(
      LINK_SIZE + 2 * slot_size <= POOL_BLOCK_SIZE,
      "slot of {slot_size} bytes does not fit a {POOL_BLOCK_SIZE}-byte block"
    );

    Self {
      slot_size,
      free: FreeStack::new(),
      bump: SpinLock::new(BumpState {
        blocks: null_mut(),
        cursor: 0,
        limit: 0,
        block_count: 0,
        carved: 0,
      }),
    }
  }

  pub fn slot_size(&self) -> usize {
    self.slot_size
  }

  /// Returns a `slot_size`-byte block whose address is a multiple of `slot_size`.
  pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
    if let Some(slot) = self.free.pop() {
      return Ok(slot.cast());
    }

    let (slot, grew) = {
      let mut bump = self.bump.lock();
      let grew = bump.cursor == bump.limit;
      if grew {
        self.grow(&mut bump)?;
      }
      let slot = bump.cursor;
      bump.cursor += self.slot_size;
      bump.carved += 1;
      (slot, grew)
    };

    #[cfg(feature = "tracing")]
    if grew {
      tracing::debug!(slot_size = self.slot_size, "pool grew a {POOL_BLOCK_SIZE}-byte block");
    }
    #[cfg(not(feature = "tracing"))]
    let _ = grew;

    Ok(unsafe { NonNull::new_unchecked(slot as *mut u8) })
  }

  /// Puts `ptr` back on the free list. Null is ignored.
  ///
  /// # Safety
  /// `ptr` must come from `allocate` on this pool and must not be used afterwards.
  pub unsafe fn deallocate(&self, ptr: *mut u8) {
    if let Some(block) = NonNull::new(ptr) {
      unsafe { self.free.push(Slot::from_block(block)) };
    }
  }

  fn grow(&self, bump: &mut BumpState) -> Result<(), AllocError> {
    let block = NonNull::new(unsafe { System.alloc(BLOCK_LAYOUT) }).ok_or(AllocError::Exhausted {
      bytes: POOL_BLOCK_SIZE,
    })?;

    unsafe { block.as_ptr().cast::<*mut u8>().write(bump.blocks) };
    bump.blocks = block.as_ptr();
    bump.block_count += 1;

    let start = block.as_ptr() as usize;
    let body = start + LINK_SIZE;
    let first = body + padding_for(body, self.slot_size);
    let fitting = (start + POOL_BLOCK_SIZE - first) / self.slot_size;

    bump.cursor = first;
    bump.limit = first + fitting * self.slot_size;
    debug_assert!(fitting > 0);
    Ok(())
  }

  /// Raw blocks owned so far. Never decreases.
  pub fn block_count(&self) -> usize {
    self.bump.lock().block_count
  }

  /// Slots ever handed out by the bump allocator.
  pub fn carved(&self) -> usize {
    self.bump.lock().carved
  }

  /// Slots on the free list. Only exact while no other thread uses the pool.
  pub fn free_len(&self) -> usize {
    self.free.len()
  }
}

impl Drop for SizeClassPool {
  fn drop(&mut self) {
    let bump = self.bump.lock();
    let mut block = bump.blocks;
    while !block.is_null() {
      let prev = unsafe { block.cast::<*mut u8>().read() };
      unsafe { System.dealloc(block, BLOCK_LAYOUT) };
      block = prev;
    }
  }
}
