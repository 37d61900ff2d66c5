//! Size-classed small-object allocation.
//!
//! Two designs live side by side:
//!
//! - [`SizeClassRegistry`]: one lock-free [`SizeClassPool`] per 16-byte size
//!   class up to 512 bytes. Freed slots go on a Treiber stack; fresh slots
//!   are bumped out of 4 KiB raw blocks.
//! - A three-tier cache: a per-thread [`ThreadCache`] in front of a shared
//!   [`CentralCache`] (per-class spin-locked free lists, span bookkeeping and
//!   delayed span return) in front of a [`PageProvider`].
//!
//! [`allocate`]/[`deallocate`] run the three-tier path through a thread-local
//! cache, and [`Allocator`] exposes it as a `GlobalAlloc`.
//!
//! ```
//! let p = tiercache::allocate(20).unwrap();
//! unsafe { tiercache::deallocate(p, 20) };
//! ```
#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, UnsafeCell},
  ptr::{self, NonNull, null_mut},
};

mod central;
mod error;
mod page;
mod pool;
mod registry;
pub mod size_class;
mod slot;
mod sync;
mod thread_cache;

pub use central::{CentralCache, ClassSnapshot, DEFAULT_MAX_DELAY_COUNT, DEFAULT_MIN_DELAY_INTERVAL, DelayPolicy};
pub use error::AllocError;
pub use page::{OsPages, PageProvider, Span};
pub use pool::SizeClassPool;
pub use registry::SizeClassRegistry;
pub use slot::{Batch, Blocks, Slot};
pub use thread_cache::ThreadCache;

use size_class::{class_index, pages_for};

// =============================================================================
// Constants
// =============================================================================

/// Size-class step. Every class serves a multiple of this many bytes.
pub const BASE_GRANULARITY: usize = 16;
/// Alignment guaranteed by the size-classed tiers.
pub const MIN_ALIGN: usize = BASE_GRANULARITY;

/// Number of [`SizeClassPool`]s in a [`SizeClassRegistry`].
pub const POOL_CLASS_COUNT: usize = 32;
pub const POOL_MAX_SIZE: usize = POOL_CLASS_COUNT * BASE_GRANULARITY;
/// Raw block a pool grows by.
pub const POOL_BLOCK_SIZE: usize = 4096;

pub const PAGE_SIZE: usize = 4096;

/// Largest request served by the thread/central tiers; larger ones go to the page provider.
pub const MAX_SMALL_SIZE: usize = 16 * 1024;
pub const CLASS_COUNT: usize = MAX_SMALL_SIZE / BASE_GRANULARITY;

/// Minimum span length in pages.
pub const SPAN_PAGES: usize = 8;
/// Spans of large classes hold at least this many blocks.
pub const BLOCKS_PER_SPAN: usize = 32;
/// Target size of one thread/central transfer.
pub const MAX_BATCH_BYTES: usize = 4 * 1024;
/// Spans the central cache can track at once.
pub const SPAN_TABLE_CAPACITY: usize = 1024;
/// Local list length past which a thread cache returns blocks to the central cache.
pub const THREAD_HIGH_WATER: usize = 256;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(BASE_GRANULARITY.is_power_of_two());
const _: () = assert!(BASE_GRANULARITY >= core::mem::size_of::<Slot>());
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_SMALL_SIZE % BASE_GRANULARITY == 0);
const _: () = assert!(POOL_BLOCK_SIZE >= 2 * POOL_MAX_SIZE + core::mem::size_of::<usize>());
const _: () = assert!(SPAN_PAGES * PAGE_SIZE >= MAX_BATCH_BYTES);
const _: () = assert!(THREAD_HIGH_WATER >= 4);

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static CACHE: UnsafeCell<Option<ThreadCache<'static>>> = const { UnsafeCell::new(None) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` on this thread's cache.
///
/// Returns `None` when re-entered from inside `f` (e.g. a logging subscriber
/// allocating) or once thread-local storage is being torn down.
fn with_cache<R>(f: impl FnOnce(&mut ThreadCache<'static>) -> R) -> Option<R> {
  let entered = IN_ALLOC.try_with(|flag| !flag.replace(true)).ok()?;
  if !entered {
    return None;
  }

  let result = CACHE
    .try_with(|cell| {
      let cache = unsafe { &mut *cell.get() };
      f(cache.get_or_insert_with(|| ThreadCache::new(CentralCache::global())))
    })
    .ok();

  let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  result
}

/// Allocates `size` bytes through this thread's cache.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
  with_cache(|cache| cache.allocate(size))
    // A one-shot cache returns its leftover batch on drop.
    .unwrap_or_else(|| ThreadCache::new(CentralCache::global()).allocate(size))
}

/// # Safety
/// `ptr` must come from [`allocate`] with the same `size` and must not be used afterwards.
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) {
  if with_cache(|cache| unsafe { cache.deallocate(ptr, size) }).is_none() {
    unsafe { ThreadCache::new(CentralCache::global()).deallocate(ptr, size) };
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// `GlobalAlloc` front end over [`allocate`]/[`deallocate`].
///
/// Layouts aligned beyond `MIN_ALIGN` get whole pages.
pub struct Allocator;

impl Allocator {
  fn over_aligned(layout: Layout) -> bool {
    layout.align() > MIN_ALIGN
  }

  /// Served by fresh pages, which the operating system hands out zeroed.
  fn page_backed(layout: Layout) -> bool {
    Self::over_aligned(layout) || layout.size() > MAX_SMALL_SIZE
  }
}

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let size = layout.size().max(1);

    if Self::over_aligned(layout) {
      if layout.align() > PAGE_SIZE {
        return null_mut();
      }
      return CentralCache::global()
        .provider()
        .acquire_span(size)
        .map_or(null_mut(), |span| span.base.as_ptr());
    }

    allocate(size).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    let size = layout.size().max(1);

    if Self::over_aligned(layout) {
      if let Err(_err) = unsafe { CentralCache::global().provider().release_span(ptr, pages_for(size)) } {
        #[cfg(feature = "tracing")]
        tracing::warn!("over-aligned block {ptr:p} leaked: {_err}");
      }
      return;
    }

    unsafe { deallocate(ptr, size) };
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let old_size = layout.size().max(1);
    let new_size_nz = new_size.max(1);

    // Same block still fits.
    if !Self::over_aligned(layout) {
      let same_class = old_size <= MAX_SMALL_SIZE
        && new_size_nz <= MAX_SMALL_SIZE
        && class_index(old_size) == class_index(new_size_nz);
      let same_pages =
        old_size > MAX_SMALL_SIZE && new_size_nz > MAX_SMALL_SIZE && pages_for(old_size) == pages_for(new_size_nz);
      if same_class || same_pages {
        return ptr;
      }
    }

    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let new_ptr = unsafe { self.alloc(new_layout) };

    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }

    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() && !Self::page_backed(layout) {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Bytes to add to `addr` to reach a multiple of `align` (any non-zero `align`).
#[inline(always)]
pub(crate) const fn padding_for(addr: usize, align: usize) -> usize {
  (align - addr % align) % align
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn padding_is_zero_when_aligned() {
    assert_eq!(padding_for(96, 48), 0);
    assert_eq!(padding_for(100, 48), 44);
    assert_eq!(padding_for(4104, 16), 8);
    assert_eq!(align_up(4097, PAGE_SIZE), 2 * PAGE_SIZE);
  }

  #[test]
  fn thread_local_path_round_trips() {
    let p = allocate(40).unwrap();
    unsafe {
      p.as_ptr().write_bytes(0xEE, 40);
      deallocate(p, 40);
    }
    assert_eq!(allocate(40).unwrap(), p);
  }

  #[test]
  fn global_alloc_honours_layouts() {
    let a = Allocator;
    unsafe {
      for (size, align) in [(1, 1), (24, 8), (100, 16), (20_000, 8), (64, 64), (8192, 4096)] {
        let layout = Layout::from_size_align(size, align).unwrap();
        let p = a.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % align, 0);
        p.write_bytes(0x11, size);
        a.dealloc(p, layout);
      }

      let too_aligned = Layout::from_size_align(16, 2 * PAGE_SIZE).unwrap();
      assert!(a.alloc(too_aligned).is_null());
    }
  }

  #[test]
  fn alloc_zeroed_clears_recycled_blocks() {
    let a = Allocator;
    unsafe {
      for (size, align) in [(48, 8), (1000, 16), (20_000, 8), (512, 256)] {
        let layout = Layout::from_size_align(size, align).unwrap();
        let dirty = a.alloc(layout);
        dirty.write_bytes(0xFF, size);
        a.dealloc(dirty, layout);

        let p = a.alloc_zeroed(layout);
        assert!(!p.is_null());
        assert!((0..size).all(|i| p.add(i).read() == 0), "{size}-byte block not zeroed");
        a.dealloc(p, layout);
      }
    }
  }

  #[test]
  fn realloc_keeps_contents() {
    let a = Allocator;
    unsafe {
      let layout = Layout::from_size_align(20, 8).unwrap();
      let p = a.alloc(layout);
      for i in 0..20 {
        p.add(i).write(i as u8);
      }

      // 20 -> 30 stays in the 32-byte class.
      let same = a.realloc(p, layout, 30);
      assert_eq!(same, p);

      let grown = a.realloc(same, Layout::from_size_align(30, 8).unwrap(), 300);
      assert_ne!(grown, p);
      for i in 0..20 {
        assert_eq!(grown.add(i).read(), i as u8);
      }
      a.dealloc(grown, Layout::from_size_align(300, 8).unwrap());
    }
  }
}
