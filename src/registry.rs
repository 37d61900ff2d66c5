use core::{
  mem::{align_of, size_of},
  ptr::NonNull,
};
use std::sync::OnceLock;

use crate::{
  AllocError, POOL_CLASS_COUNT, POOL_MAX_SIZE,
  pool::SizeClassPool,
  size_class::{class_index, class_size},
};

static REGISTRY: OnceLock<SizeClassRegistry> = OnceLock::new();

/// Fixed array of [`SizeClassPool`]s, one per `BASE_GRANULARITY` step up to
/// `POOL_MAX_SIZE` bytes.
///
/// Callers must hand the original request size back on `deallocate`: the
/// registry does not recover sizes from pointers.
pub struct SizeClassRegistry {
  pools: [SizeClassPool; POOL_CLASS_COUNT],
}

impl SizeClassRegistry {
  pub fn new() -> Self {
    Self {
      pools: core::array::from_fn(|index| SizeClassPool::new(class_size(index))),
    }
  }

  /// Builds the process-wide registry. Safe to call any number of times.
  pub fn initialize() -> &'static Self {
    REGISTRY.get_or_init(Self::new)
  }

  /// The process-wide registry, if [`initialize`](Self::initialize) has run.
  pub fn global() -> Option<&'static Self> {
    REGISTRY.get()
  }

  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    self.pool_for(size)?.allocate()
  }

  /// # Safety
  /// `ptr` must come from `allocate(size)` on this registry with the same
  /// `size`, and must not be used afterwards. Null is ignored.
  pub unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
    let pool = match self.pool_for(size) {
      Ok(pool) => pool,
      Err(err) => panic!("deallocate of {ptr:p}: {err}"),
    };
    unsafe { pool.deallocate(ptr) };
  }

  /// Moves `value` into pool memory.
  pub fn new_element<T>(&self, value: T) -> Result<NonNull<T>, AllocError> {
    let ptr = self.allocate(size_of::<T>())?.cast::<T>();
    debug_assert_eq!(ptr.as_ptr() as usize % align_of::<T>(), 0);
    unsafe { ptr.as_ptr().write(value) };
    Ok(ptr)
  }

  /// Drops the value behind `ptr` and returns its slot.
  ///
  /// # Safety
  /// `ptr` must come from `new_element` on this registry and must not be used afterwards.
  pub unsafe fn delete_element<T>(&self, ptr: NonNull<T>) {
    unsafe {
      ptr.as_ptr().drop_in_place();
      self.deallocate(ptr.as_ptr().cast(), size_of::<T>());
    }
  }

  pub fn pool(&self, index: usize) -> Option<&SizeClassPool> {
    self.pools.get(index)
  }

  fn pool_for(&self, size: usize) -> Result<&SizeClassPool, AllocError> {
    if size > POOL_MAX_SIZE {
      return Err(AllocError::Oversized {
        size,
        max: POOL_MAX_SIZE,
      });
    }
    Ok(&self.pools[class_index(size)])
  }
}

impl Default for SizeClassRegistry {
  fn default() -> Self {
    Self::new()
  }
}
