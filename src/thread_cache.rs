use core::ptr::NonNull;

use crate::{
  AllocError, CLASS_COUNT, MAX_SMALL_SIZE, THREAD_HIGH_WATER,
  central::CentralCache,
  page::{OsPages, PageProvider},
  size_class::{class_index, pages_for},
  slot::{Slot, SlotList},
};

/// Per-thread front of a [`CentralCache`].
///
/// Never shared, so its lists need no synchronization. Blocks move to and
/// from the central tier in batches; requests above `MAX_SMALL_SIZE` go
/// straight to the page provider.
pub struct ThreadCache<'a, P: PageProvider = OsPages> {
  central: &'a CentralCache<P>,
  lists: [SlotList; CLASS_COUNT],
}

impl<'a, P: PageProvider> ThreadCache<'a, P> {
  pub fn new(central: &'a CentralCache<P>) -> Self {
    Self {
      central,
      lists: [const { SlotList::new() }; CLASS_COUNT],
    }
  }

  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    if size > MAX_SMALL_SIZE {
      return self.central.provider().acquire_span(size).map(|span| span.base);
    }

    let index = class_index(size);
    let list = &mut self.lists[index];
    if let Some(slot) = list.pop() {
      return Ok(slot.cast());
    }

    list.push_batch(self.central.fetch_range(index)?);
    match list.pop() {
      Some(slot) => Ok(slot.cast()),
      None => unreachable!("central cache returned an empty batch"),
    }
  }

  /// # Safety
  /// `ptr` must come from `allocate(size)` on a cache bound to the same
  /// central cache, with the same `size`, and must not be used afterwards.
  pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
    if size > MAX_SMALL_SIZE {
      if let Err(_err) = unsafe { self.central.provider().release_span(ptr, pages_for(size)) } {
        #[cfg(feature = "tracing")]
        tracing::warn!("large block {ptr:p} leaked: {_err}");
      }
      return;
    }

    let index = class_index(size);
    let list = &mut self.lists[index];
    unsafe { list.push(Slot::from_block(ptr)) };

    if list.len() > THREAD_HIGH_WATER {
      // Keep the most recently freed quarter hot.
      let keep = (list.len() / 4).max(1);
      if let Some(surplus) = list.split_off(keep) {
        unsafe { self.central.return_range(surplus.head(), surplus.count(), index) };
      }
    }
  }

  /// Hands every cached block back to the central cache.
  pub fn flush(&mut self) {
    for (index, list) in self.lists.iter_mut().enumerate() {
      let len = list.len();
      if let Some(batch) = list.take(len) {
        unsafe { self.central.return_range(batch.head(), batch.count(), index) };
      }
    }
  }

  /// Blocks of class `index` held locally.
  pub fn cached(&self, index: usize) -> usize {
    self.lists[index].len()
  }
}

impl<P: PageProvider> Drop for ThreadCache<'_, P> {
  fn drop(&mut self) {
    self.flush();
  }
}
